//! End-of-load and end-of-shutdown reports.

use serde::{Deserialize, Serialize};
use shard_api::LifecycleState;
use std::path::PathBuf;
use tracing::{info, warn};

/// Outcome of loading one shard archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardLoadResult {
    /// Shard id, or the archive file name when no descriptor could be read
    pub id: String,
    pub name: String,
    pub version: Option<String>,
    pub archive: PathBuf,
    pub duration_ms: u64,
    pub success: bool,
    /// Where the lifecycle stopped
    pub state: LifecycleState,
    /// `"<kind>: <message>"` when the shard failed
    pub error: Option<String>,
    pub commands_bound: usize,
    pub command_errors: Vec<String>,
    /// Resolved library paths appended to the shard's loader
    pub libraries: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    /// One entry per discovered archive, in discovery order
    pub results: Vec<ShardLoadResult>,
    /// Ids in the order their setup ran
    pub install_order: Vec<String>,
    pub total_duration_ms: u64,
}

impl LoadReport {
    pub fn successes(&self) -> usize {
        self.results.iter().filter(|result| result.success).count()
    }

    pub fn failures(&self) -> usize {
        self.results.len() - self.successes()
    }

    pub fn get(&self, id: &str) -> Option<&ShardLoadResult> {
        self.results.iter().find(|result| result.id == id)
    }

    /// Results that failed with the given error kind.
    pub fn failed_with(&self, kind: &str) -> Vec<&ShardLoadResult> {
        self.results
            .iter()
            .filter(|result| {
                result
                    .error
                    .as_deref()
                    .is_some_and(|error| error.split(':').next() == Some(kind))
            })
            .collect()
    }

    /// The boxed summary table, one string per line.
    pub fn render(&self) -> Vec<String> {
        let rows: Vec<[String; 4]> = self
            .results
            .iter()
            .map(|result| {
                let name = match &result.version {
                    Some(version) => format!("{} v{}", result.name, version),
                    None => result.name.clone(),
                };
                let status = if result.success {
                    format!("OK ({} cmd)", result.commands_bound)
                } else {
                    "FAILED".to_string()
                };
                [
                    result.id.clone(),
                    name,
                    format!("{} ms", result.duration_ms),
                    status,
                ]
            })
            .collect();

        let headers = ["Shard", "Name", "Time", "Status"];
        let mut widths = headers.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let rule = |left: &str, middle: &str, right: &str| {
            let segments: Vec<String> = widths.iter().map(|width| "─".repeat(width + 2)).collect();
            format!("{}{}{}", left, segments.join(middle), right)
        };
        let line = |cells: &[String]| {
            let padded: Vec<String> = cells
                .iter()
                .zip(widths)
                .map(|(cell, width)| format!(" {:<width$} ", cell, width = width))
                .collect();
            format!("│{}│", padded.join("│"))
        };

        let mut lines = vec![
            rule("┌", "┬", "┐"),
            line(&headers.map(String::from)),
            rule("├", "┼", "┤"),
        ];
        lines.extend(rows.iter().map(|row| line(&row[..])));
        lines.push(rule("└", "┴", "┘"));
        lines.push(format!(
            "{}/{} shards loaded in {} ms",
            self.successes(),
            self.results.len(),
            self.total_duration_ms
        ));
        lines.extend(
            self.results
                .iter()
                .filter_map(|result| Some(format!("  {}: {}", result.id, result.error.as_ref()?))),
        );
        lines
    }

    /// Logs the rendered table, then one warning per failed shard.
    pub fn log(&self) {
        for line in self.render() {
            info!("{}", line);
        }
        for result in self.results.iter().filter(|result| !result.success) {
            warn!(
                shard = %result.id,
                state = %result.state,
                "{}",
                result.error.as_deref().unwrap_or("unknown failure")
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeardownResult {
    pub id: String,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    /// Command routes removed from the dispatcher
    pub routes_removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeardownReport {
    /// In teardown order: reverse activation order
    pub results: Vec<TeardownResult>,
}

impl TeardownReport {
    pub fn successes(&self) -> usize {
        self.results.iter().filter(|result| result.success).count()
    }

    pub fn failures(&self) -> usize {
        self.results.len() - self.successes()
    }

    pub fn log(&self) {
        info!(
            "{}/{} shards shut down cleanly",
            self.successes(),
            self.results.len()
        );
        for result in self.results.iter().filter(|result| !result.success) {
            warn!(
                shard = %result.id,
                "Teardown failed: {}",
                result.error.as_deref().unwrap_or("unknown failure")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, error: Option<&str>) -> ShardLoadResult {
        ShardLoadResult {
            id: id.to_string(),
            name: id.to_uppercase(),
            version: Some("1.0.0".to_string()),
            archive: PathBuf::from(format!("{}.so", id)),
            duration_ms: 12,
            success: error.is_none(),
            state: if error.is_none() {
                LifecycleState::Active
            } else {
                LifecycleState::DependenciesResolved
            },
            error: error.map(String::from),
            commands_bound: 2,
            command_errors: Vec::new(),
            libraries: Vec::new(),
        }
    }

    #[test]
    fn test_counts_and_kind_lookup() {
        let report = LoadReport {
            results: vec![
                result("a", Some("CircularDependencyError: a -> b -> a")),
                result("b", Some("CircularDependencyError: b -> a -> b")),
                result("c", None),
            ],
            install_order: vec!["c".into()],
            total_duration_ms: 40,
        };

        assert_eq!(report.successes(), 1);
        assert_eq!(report.failures(), 2);
        assert_eq!(report.failed_with("CircularDependencyError").len(), 2);
        assert!(report.failed_with("MissingDependencyError").is_empty());
    }

    #[test]
    fn test_render_is_aligned() {
        let report = LoadReport {
            results: vec![result("economy", None), result("x", Some("MissingFactoryError: no factory"))],
            install_order: vec!["economy".into()],
            total_duration_ms: 7,
        };
        let lines = report.render();

        // Table rows all have the same display width.
        let width = lines[0].chars().count();
        for line in &lines[..6] {
            assert_eq!(line.chars().count(), width, "{}", line);
        }
        assert!(lines.contains(&"1/2 shards loaded in 7 ms".to_string()));
        assert!(lines.contains(&"  x: MissingFactoryError: no factory".to_string()));
    }
}
