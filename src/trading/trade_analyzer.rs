use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::trading::Position;

const DIMENSIONS: &[&str] = &["exit_reason", "timeframe", "side", "symbol", "confidence_bucket"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketStats {
    pub dimension: String,
    pub value: String,
    pub total: usize,
    pub wins: usize,
    pub losses: usize,
    /// Percent, 0..100, as on the portfolio snapshot.
    pub win_rate: f64,
    pub avg_pnl: f64,
    pub total_pnl: f64,
    /// Gross win over gross loss. `None` when nothing lost.
    pub profit_factor: Option<f64>,
    pub edge: f64,
    pub sample_sufficient: bool,
}

/// Whole-history performance figures with the exit-reason and timeframe breakdowns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedStats {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_profit: f64,
    /// Mean of the losing trades, a negative number.
    pub avg_loss: f64,
    pub largest_profit: f64,
    pub largest_loss: f64,
    pub profit_factor: Option<f64>,
    pub by_exit_reason: HashMap<String, BucketStats>,
    pub by_timeframe: HashMap<String, BucketStats>,
}

/// Breaks closed positions down by exit reason, timeframe, side, symbol and confidence.
pub struct TradeAnalyzer {
    pub min_sample: usize,
}

impl TradeAnalyzer {
    pub fn new(min_sample: usize) -> Self {
        Self { min_sample }
    }

    pub fn analyze(&self, history: &[Position]) -> HashMap<String, HashMap<String, BucketStats>> {
        let closed: Vec<&Position> = history.iter().filter(|p| p.realized_pnl.is_some()).collect();

        let mut results = HashMap::new();
        for &dim in DIMENSIONS {
            results.insert(dim.to_string(), self.analyze_dimension(&closed, dim));
        }
        results
    }

    pub fn detailed_stats(&self, history: &[Position]) -> DetailedStats {
        let closed: Vec<&Position> = history.iter().filter(|p| p.realized_pnl.is_some()).collect();
        let pnls: Vec<f64> = closed.iter().filter_map(|p| p.realized_pnl).collect();

        let profits: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losing: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();
        let gross_win: f64 = profits.iter().sum();
        let gross_loss: f64 = losing.iter().sum::<f64>().abs();

        let total_trades = pnls.len();
        let wins = profits.len();
        DetailedStats {
            total_trades,
            wins,
            losses: total_trades - wins,
            win_rate: round4(pct(wins, total_trades)),
            total_pnl: round4(pnls.iter().sum()),
            avg_profit: round4(mean(&profits)),
            avg_loss: round4(mean(&losing)),
            largest_profit: profits.iter().copied().fold(0.0, f64::max),
            largest_loss: losing.iter().copied().fold(0.0, f64::min),
            profit_factor: profit_factor(gross_win, gross_loss),
            by_exit_reason: self.analyze_dimension(&closed, "exit_reason"),
            by_timeframe: self.analyze_dimension(&closed, "timeframe"),
        }
    }

    /// Buckets with enough samples and a negative expectancy, worst first.
    pub fn get_negative_edge_buckets(
        &self,
        analysis: &HashMap<String, HashMap<String, BucketStats>>,
    ) -> Vec<BucketStats> {
        let mut out: Vec<BucketStats> = analysis
            .values()
            .flat_map(|dim_stats| dim_stats.values())
            .filter(|b| b.sample_sufficient && b.edge < 0.0)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.edge.total_cmp(&b.edge));
        out
    }

    fn analyze_dimension(&self, closed: &[&Position], dimension: &str) -> HashMap<String, BucketStats> {
        let mut buckets: HashMap<String, Vec<&Position>> = HashMap::new();
        for p in closed {
            if let Some(key) = extract_key(p, dimension) {
                buckets.entry(key).or_default().push(p);
            }
        }

        buckets
            .into_iter()
            .map(|(value, trades)| {
                let stats = self.compute_stats(dimension, &value, &trades);
                (value, stats)
            })
            .collect()
    }

    fn compute_stats(&self, dimension: &str, value: &str, trades: &[&Position]) -> BucketStats {
        let pnls: Vec<f64> = trades.iter().map(|t| t.realized_pnl.unwrap_or(0.0)).collect();
        let total = pnls.len();
        let wins = pnls.iter().filter(|p| **p > 0.0).count();
        let losses = total - wins;
        let win_frac = if total > 0 { wins as f64 / total as f64 } else { 0.0 };

        let total_pnl: f64 = pnls.iter().sum();
        let avg_pnl = if total > 0 { total_pnl / total as f64 } else { 0.0 };

        let gross_win: f64 = pnls.iter().filter(|p| **p > 0.0).sum();
        let gross_loss: f64 = pnls.iter().filter(|p| **p <= 0.0).sum::<f64>().abs();
        let avg_win = if wins > 0 { gross_win / wins as f64 } else { 0.0 };
        let avg_loss = if losses > 0 { gross_loss / losses as f64 } else { 0.0 };

        let edge = if total > 0 {
            (win_frac * avg_win) - ((1.0 - win_frac) * avg_loss)
        } else {
            0.0
        };

        BucketStats {
            dimension: dimension.to_string(),
            value: value.to_string(),
            total,
            wins,
            losses,
            win_rate: round4(pct(wins, total)),
            avg_pnl: round4(avg_pnl),
            total_pnl: round4(total_pnl),
            profit_factor: profit_factor(gross_win, gross_loss),
            edge: round4(edge),
            sample_sufficient: total >= self.min_sample,
        }
    }
}

fn extract_key(p: &Position, dimension: &str) -> Option<String> {
    match dimension {
        "exit_reason" => Some(p.exit_reason.map(|r| r.to_string()).unwrap_or_else(|| "unknown".to_string())),
        "timeframe" => Some(p.timeframe.to_string()),
        "side" => Some(p.side.to_string()),
        "symbol" => Some(p.symbol.clone()),
        "confidence_bucket" => Some(
            if p.confidence >= 0.8 {
                "high_0.8+"
            } else if p.confidence >= 0.6 {
                "mid_0.6-0.8"
            } else if p.confidence >= 0.4 {
                "low_0.4-0.6"
            } else {
                "very_low_<0.4"
            }
            .to_string(),
        ),
        _ => None,
    }
}

fn round4(x: f64) -> f64 {
    (x * 10000.0).round() / 10000.0
}

fn pct(part: usize, total: usize) -> f64 {
    if total > 0 {
        part as f64 / total as f64 * 100.0
    } else {
        0.0
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn profit_factor(gross_win: f64, gross_loss: f64) -> Option<f64> {
    (gross_loss > 0.0).then(|| round4(gross_win / gross_loss))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExitReason, PositionStatus, Side};
    use crate::test_helpers::make_position;

    fn closed(side: Side, pnl: f64, reason: ExitReason, confidence: f64) -> Position {
        let mut p = make_position(side, 100.0, 1.0);
        p.status = PositionStatus::Closed;
        p.realized_pnl = Some(pnl);
        p.exit_reason = Some(reason);
        p.confidence = confidence;
        p
    }

    #[test]
    fn buckets_by_exit_reason() {
        let history = vec![
            closed(Side::Buy, 20.0, ExitReason::TakeProfit, 0.9),
            closed(Side::Buy, 30.0, ExitReason::TakeProfit, 0.7),
            closed(Side::Sell, -10.0, ExitReason::StopLoss, 0.5),
            closed(Side::Sell, -15.0, ExitReason::StopLoss, 0.3),
            closed(Side::Buy, 5.0, ExitReason::Manual, 0.5),
        ];
        let analyzer = TradeAnalyzer::new(2);
        let analysis = analyzer.analyze(&history);

        let by_reason = &analysis["exit_reason"];
        assert_eq!(by_reason["take_profit"].total, 2);
        assert_eq!(by_reason["take_profit"].win_rate, 100.0);
        assert_eq!(by_reason["take_profit"].profit_factor, None);
        assert_eq!(by_reason["stop_loss"].total_pnl, -25.0);
        assert!(!by_reason["manual"].sample_sufficient);

        let by_side = &analysis["side"];
        assert_eq!(by_side["buy"].wins, 3);
        assert!((by_side["sell"].avg_pnl + 12.5).abs() < 1e-9);

        let negative = analyzer.get_negative_edge_buckets(&analysis);
        assert!(negative.iter().any(|b| b.dimension == "exit_reason" && b.value == "stop_loss"));
        assert!(negative.windows(2).all(|w| w[0].edge <= w[1].edge));
    }

    #[test]
    fn profit_factor_is_gross_win_over_gross_loss() {
        let history = vec![
            closed(Side::Buy, 30.0, ExitReason::TakeProfit, 0.9),
            closed(Side::Buy, -10.0, ExitReason::StopLoss, 0.9),
        ];
        let analysis = TradeAnalyzer::new(1).analyze(&history);
        let high = &analysis["confidence_bucket"]["high_0.8+"];
        assert_eq!(high.profit_factor, Some(3.0));
        assert!((high.edge - 10.0).abs() < 1e-9);
        assert_eq!(high.win_rate, 50.0);
    }

    #[test]
    fn detailed_stats_summarise_history() {
        let mut history = vec![
            closed(Side::Buy, 40.0, ExitReason::TakeProfit, 0.9),
            closed(Side::Buy, 20.0, ExitReason::TakeProfit, 0.9),
            closed(Side::Sell, -30.0, ExitReason::StopLoss, 0.6),
            closed(Side::Sell, -10.0, ExitReason::Manual, 0.6),
        ];
        history[3].timeframe = crate::models::Timeframe::M15;
        // still open, ignored
        history.push(make_position(Side::Buy, 100.0, 1.0));

        let stats = TradeAnalyzer::new(1).detailed_stats(&history);
        assert_eq!(stats.total_trades, 4);
        assert_eq!(stats.wins, 2);
        assert_eq!(stats.losses, 2);
        assert_eq!(stats.win_rate, 50.0);
        assert_eq!(stats.total_pnl, 20.0);
        assert_eq!(stats.avg_profit, 30.0);
        assert_eq!(stats.avg_loss, -20.0);
        assert_eq!(stats.largest_profit, 40.0);
        assert_eq!(stats.largest_loss, -30.0);
        assert_eq!(stats.profit_factor, Some(1.5));

        assert_eq!(stats.by_exit_reason["take_profit"].total, 2);
        assert_eq!(stats.by_exit_reason["stop_loss"].total_pnl, -30.0);
        assert_eq!(stats.by_timeframe["1h"].total, 3);
        assert!((stats.by_timeframe["1h"].win_rate - 200.0 / 3.0).abs() < 1e-3);
        assert_eq!(stats.by_timeframe["15m"].wins, 0);
    }

    #[test]
    fn no_losses_leaves_profit_factor_undefined() {
        let history = vec![closed(Side::Buy, 5.0, ExitReason::TakeProfit, 0.9)];
        let stats = TradeAnalyzer::new(1).detailed_stats(&history);
        assert_eq!(stats.profit_factor, None);
        assert_eq!(stats.win_rate, 100.0);
        assert_eq!(stats.avg_loss, 0.0);
        assert_eq!(stats.largest_loss, 0.0);

        let empty = TradeAnalyzer::new(1).detailed_stats(&[]);
        assert_eq!(empty.total_trades, 0);
        assert_eq!(empty.win_rate, 0.0);
        assert_eq!(empty.profit_factor, None);
    }
}
