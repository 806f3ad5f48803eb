use std::fmt::Write as _;

use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    agronomy::validate::BacktestReport,
    error::{CropcastResult, IoError},
    pipeline::PipelineResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Markdown,
    Text,
    Json,
}

/// Render a backtest report in the requested format.
pub fn render_backtest(report: &BacktestReport, format: ReportFormat) -> CropcastResult<String> {
    match format {
        ReportFormat::Json => {
            serde_json::to_string_pretty(report).map_err(|e| IoError::Json(e).into())
        }
        ReportFormat::Markdown => Ok(backtest_markdown(report)),
        ReportFormat::Text => Ok(strip_markdown(&backtest_markdown(report))),
    }
}

fn backtest_markdown(report: &BacktestReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# Yield Model Validation — {} ({})\n",
        report.crop, report.train_years
    );

    let _ = writeln!(out, "## Backtest accuracy by forecast week\n");
    let _ = writeln!(
        out,
        "| Week | N | RMSE | MAE | Mean err | Median err | Max abs | R² | Dir. acc |"
    );
    let _ = writeln!(out, "|---|---|---|---|---|---|---|---|---|");
    for m in &report.week_metrics {
        let _ = writeln!(
            out,
            "| {} | {} | {:.2} | {:.2} | {:+.2} | {:+.2} | {:.2} | {} | {:.0}% |",
            m.week,
            m.n,
            m.rmse,
            m.mae,
            m.mean_error,
            m.median_error,
            m.max_abs_error,
            m.r2.map(|v| format!("{v:.3}")).unwrap_or_else(|| "—".into()),
            m.directional_accuracy * 100.0,
        );
    }

    let _ = writeln!(out, "\n## Skill vs benchmarks\n");
    let _ = writeln!(out, "| Week | vs trend | vs last year | vs 5-yr avg |");
    let _ = writeln!(out, "|---|---|---|---|");
    let fmt_skill = |v: Option<f64>| {
        v.map(|s| format!("{s:+.3}"))
            .unwrap_or_else(|| "—".to_string())
    };
    for s in &report.skill {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} |",
            s.week,
            fmt_skill(s.vs_trend),
            fmt_skill(s.vs_last_year),
            fmt_skill(s.vs_five_year_avg),
        );
    }

    let _ = writeln!(out, "\n## Bias\n");
    let _ = writeln!(
        out,
        "Overall mean error: {:+.2} bu/ac over {} forecasts\n",
        report.bias_overall.mean_error, report.bias_overall.n
    );
    let _ = writeln!(out, "Worst states by |mean error|:\n");
    for slice in &report.bias_by_state {
        let _ = writeln!(
            out,
            "- {}: {:+.2} (n={})",
            slice.key, slice.mean_error, slice.n
        );
    }
    let _ = writeln!(out, "\nBy week:\n");
    for slice in &report.bias_by_week {
        let _ = writeln!(
            out,
            "- {}: {:+.2} (n={})",
            slice.key, slice.mean_error, slice.n
        );
    }
    let _ = writeln!(out, "\nBy year:\n");
    for slice in &report.bias_by_year {
        let _ = writeln!(
            out,
            "- {}: {:+.2} (n={})",
            slice.key, slice.mean_error, slice.n
        );
    }

    if !report.revisions.is_empty() {
        let _ = writeln!(out, "\n## Largest forecast revisions\n");
        for r in &report.revisions {
            let _ = writeln!(
                out,
                "- {} {} {} week {}: {:+.1} ({})",
                r.commodity, r.state, r.year, r.forecast_week, r.wow_change, r.primary_driver
            );
        }
    }

    out
}

/// CLI summary block for a pipeline pass: outcome, counts, and the first few
/// errors/warnings. Full detail stays in the JSON logs.
pub fn pipeline_summary(result: &PipelineResult) -> String {
    let mut out = String::new();
    let status = if result.success { "SUCCESS" } else { "FAILURE" };
    let duration = result
        .end_time
        .map(|end| (end - result.start_time).num_milliseconds() as f64 / 1000.0)
        .unwrap_or(0.0);

    let _ = writeln!(out, "==== Pipeline {status} ====");
    let _ = writeln!(
        out,
        "periods: {}  countries: {}  duration: {duration:.1}s",
        result.periods_processed.join(", "),
        result.countries_processed.join(", "),
    );
    let _ = writeln!(
        out,
        "records: {} fetched / {} loaded, {} errors",
        result.total_records_fetched, result.total_records_loaded, result.total_errors
    );

    if let Some(h) = &result.harmonization {
        let _ = writeln!(
            out,
            "harmonized: {}/{} rows, {} balance entries, {} discrepancies",
            h.harmonized_records, h.input_records, h.balance_entries, h.discrepancies
        );
    }

    let errors: Vec<&str> = result
        .country_results
        .values()
        .flat_map(|flows| flows.values())
        .filter_map(|r| r.error.as_deref())
        .collect();
    if !errors.is_empty() {
        let _ = writeln!(out, "first errors:");
        for error in errors.iter().take(5) {
            let _ = writeln!(out, "  - {error}");
        }
    }

    let warnings: Vec<&str> = result
        .quality_alerts
        .iter()
        .map(|a| a.message.as_str())
        .collect();
    if !warnings.is_empty() {
        let _ = writeln!(out, "first warnings:");
        for warning in warnings.iter().take(5) {
            let _ = writeln!(out, "  - {warning}");
        }
    }
    out
}

fn strip_markdown(markdown: &str) -> String {
    markdown
        .lines()
        .map(|line| line.trim_start_matches('#').trim_start())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use crate::agronomy::{
        calendar::Crop,
        validate::{BacktestReport, BiasSlice, SkillScores, WeekMetrics},
    };

    use super::*;

    fn report() -> BacktestReport {
        BacktestReport {
            crop: Crop::Corn,
            train_years: "2005-2023".into(),
            week_metrics: vec![WeekMetrics {
                week: 30,
                n: 12,
                rmse: 8.4,
                mae: 6.1,
                mean_error: -1.2,
                median_error: -0.8,
                max_abs_error: 19.5,
                r2: Some(0.61),
                directional_accuracy: 0.75,
            }],
            skill: vec![SkillScores {
                week: 30,
                vs_trend: Some(0.32),
                vs_last_year: Some(0.18),
                vs_five_year_avg: None,
            }],
            bias_overall: BiasSlice {
                key: "overall".into(),
                n: 12,
                mean_error: -1.2,
            },
            bias_by_state: vec![BiasSlice {
                key: "IA".into(),
                n: 4,
                mean_error: 3.4,
            }],
            bias_by_week: vec![],
            bias_by_year: vec![],
            revisions: vec![],
        }
    }

    #[test]
    fn markdown_contains_all_sections() {
        let text = render_backtest(&report(), ReportFormat::Markdown).unwrap();
        assert!(text.contains("# Yield Model Validation — corn"));
        assert!(text.contains("| 30 | 12 |"));
        assert!(text.contains("Skill vs benchmarks"));
        assert!(text.contains("+0.320"));
        assert!(text.contains("Worst states"));
    }

    #[test]
    fn json_round_trips() {
        let text = render_backtest(&report(), ReportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["crop"], "corn");
        assert_eq!(value["week_metrics"][0]["n"], 12);
    }

    #[test]
    fn text_format_drops_heading_markers() {
        let text = render_backtest(&report(), ReportFormat::Text).unwrap();
        assert!(!text.contains("# "));
        assert!(text.contains("Yield Model Validation"));
    }
}
