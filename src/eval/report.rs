use std::{
    collections::BTreeMap,
    fs,
    io::{BufWriter, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::EvalError,
    eval::{
        scenario::EvalMode,
        verdict::{Verdict, VerdictStatus},
    },
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRecord {
    pub scenario_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_mode: Option<EvalMode>,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    /// Graded but not passed.
    pub failed: usize,
    pub errored: usize,
    pub cancelled: usize,
    pub malformed: usize,
    pub pass_rate: f64,
    /// Mean over graded scenarios only.
    pub mean_score: f64,
    pub mean_sub_scores: BTreeMap<String, f64>,
}

impl RunSummary {
    fn from_records(records: &[ScenarioRecord]) -> Self {
        let mut summary = RunSummary {
            total: records.len(),
            ..RunSummary::default()
        };
        let mut score_sum = 0.0;
        let mut graded = 0usize;
        let mut sub_sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();

        for record in records {
            let verdict = &record.verdict;
            match verdict.status() {
                VerdictStatus::Graded => {
                    graded += 1;
                    score_sum += verdict.score();
                    if verdict.passed() {
                        summary.passed += 1;
                    } else {
                        summary.failed += 1;
                    }
                    for (name, score) in verdict.sub_scores() {
                        let entry = sub_sums.entry(name.clone()).or_insert((0.0, 0));
                        entry.0 += score;
                        entry.1 += 1;
                    }
                }
                VerdictStatus::Errored => summary.errored += 1,
                VerdictStatus::Cancelled => summary.cancelled += 1,
                VerdictStatus::Malformed => summary.malformed += 1,
            }
        }

        if summary.total > 0 {
            summary.pass_rate = summary.passed as f64 / summary.total as f64;
        }
        if graded > 0 {
            summary.mean_score = score_sum / graded as f64;
        }
        summary.mean_sub_scores = sub_sums
            .into_iter()
            .map(|(name, (sum, count))| (name, sum / count as f64))
            .collect();
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub summary: RunSummary,
    pub records: Vec<ScenarioRecord>,
}

#[derive(Serialize)]
struct SummaryLine<'a> {
    summary: &'a RunSummary,
}

impl RunReport {
    pub fn all_passed(&self) -> bool {
        self.summary.total > 0 && self.summary.passed == self.summary.total
    }

    pub fn record(&self, scenario_id: &str) -> Option<&ScenarioRecord> {
        self.records
            .iter()
            .find(|record| record.scenario_id == scenario_id)
    }

    pub fn to_json_pretty(&self) -> Result<String, EvalError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// One record per line, then a final `{"summary": ...}` line.
    pub fn to_jsonl(&self) -> Result<String, EvalError> {
        let mut out = Vec::new();
        self.write_jsonl_to(&mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn write_jsonl_to(&self, writer: &mut impl Write) -> Result<(), EvalError> {
        for record in &self.records {
            serde_json::to_writer(&mut *writer, record)?;
            writer.write_all(b"\n")?;
        }
        serde_json::to_writer(
            &mut *writer,
            &SummaryLine {
                summary: &self.summary,
            },
        )?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), EvalError> {
        let path = path.as_ref();
        ensure_parent_dir(path)?;
        fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }

    pub fn write_jsonl(&self, path: impl AsRef<Path>) -> Result<(), EvalError> {
        let path = path.as_ref();
        ensure_parent_dir(path)?;
        let mut writer = BufWriter::new(fs::File::create(path)?);
        self.write_jsonl_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Collects records as scenarios finish, in any order.
#[derive(Debug, Default)]
pub struct RunAccumulator {
    records: Vec<ScenarioRecord>,
}

impl RunAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, record: ScenarioRecord) {
        self.records.push(record);
    }

    /// Sorts by scenario id so the report does not depend on completion
    /// order.
    pub fn finish(mut self) -> RunReport {
        self.records
            .sort_by(|a, b| a.scenario_id.cmp(&b.scenario_id));
        RunReport {
            summary: RunSummary::from_records(&self.records),
            records: self.records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::verdict::Failure;
    use std::time::Duration;

    fn graded(id: &str, passed: bool, score: f64, tone: f64) -> ScenarioRecord {
        ScenarioRecord {
            scenario_id: id.to_string(),
            eval_mode: Some(EvalMode::Trajectory),
            verdict: Verdict::graded(passed, score)
                .with_sub_scores([("tone".to_string(), tone)].into_iter().collect()),
        }
    }

    fn accumulate(order: &[ScenarioRecord]) -> RunReport {
        let mut accumulator = RunAccumulator::new();
        for record in order {
            accumulator.record(record.clone());
        }
        accumulator.finish()
    }

    fn sample() -> Vec<ScenarioRecord> {
        vec![
            graded("c", true, 0.9, 1.0),
            graded("a", false, 0.5, 0.5),
            ScenarioRecord {
                scenario_id: "b".into(),
                eval_mode: Some(EvalMode::Step),
                verdict: Verdict::errored(Failure::agent("drive", "agent unavailable")),
            },
            ScenarioRecord {
                scenario_id: "d".into(),
                eval_mode: None,
                verdict: Verdict::malformed("bad json"),
            },
            ScenarioRecord {
                scenario_id: "e".into(),
                eval_mode: Some(EvalMode::Trajectory),
                verdict: Verdict::cancelled(Duration::from_millis(10)),
            },
        ]
    }

    #[test]
    fn summary_counts_each_status_once() {
        let report = accumulate(&sample());
        let summary = &report.summary;

        assert_eq!(summary.total, 5);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errored, 1);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.cancelled, 1);
        assert!((summary.pass_rate - 0.2).abs() < 1e-9);
        assert!((summary.mean_score - 0.7).abs() < 1e-9);
        assert!((summary.mean_sub_scores["tone"] - 0.75).abs() < 1e-9);
        assert!(!report.all_passed());
    }

    #[test]
    fn report_is_independent_of_completion_order() {
        let records = sample();
        let mut reversed = records.clone();
        reversed.reverse();

        let forward = accumulate(&records);
        let backward = accumulate(&reversed);

        assert_eq!(forward.to_json_pretty().expect("json"), backward.to_json_pretty().expect("json"));
        let ids: Vec<&str> = forward.records.iter().map(|r| r.scenario_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn jsonl_ends_with_summary_line() {
        let report = accumulate(&sample());
        let jsonl = report.to_jsonl().expect("jsonl");
        let lines: Vec<&str> = jsonl.lines().collect();

        assert_eq!(lines.len(), 6);
        let last: serde_json::Value = serde_json::from_str(lines[5]).expect("summary");
        assert_eq!(last["summary"]["total"], 5);
        let first: ScenarioRecord = serde_json::from_str(lines[0]).expect("record");
        assert_eq!(first.scenario_id, "a");
    }

    #[test]
    fn writes_into_missing_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runs").join("report.json");
        let report = accumulate(&sample());

        report.write_json(&path).expect("write");
        let read: RunReport = serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(read, report);
    }

    #[test]
    fn empty_run_does_not_pass() {
        let report = RunAccumulator::new().finish();
        assert_eq!(report.summary.total, 0);
        assert_eq!(report.summary.pass_rate, 0.0);
        assert!(!report.all_passed());
    }
}
