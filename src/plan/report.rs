use serde::ser::{Serialize, SerializeMap, Serializer};

use super::TestPlan;
use crate::execution::ExecutionResult;

/// `file -> runtime label -> result`, laid out in plan order.
///
/// Slots exist for every planned pair; only settled jobs have a result, and
/// serialization skips the rest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestPlanReport {
    files: Vec<(String, Vec<(String, Option<ExecutionResult>)>)>,
}

impl TestPlanReport {
    pub fn for_plan(plan: &TestPlan) -> Self {
        let files = plan
            .layout()
            .map(|(file, labels)| {
                (
                    file.to_string(),
                    labels.into_iter().map(|label| (label.to_string(), None)).collect(),
                )
            })
            .collect();
        Self { files }
    }

    /// Record a result. Pairs missing from the plan are appended.
    pub fn insert(&mut self, file_key: &str, runtime_label: &str, result: ExecutionResult) {
        let runtimes = match self.files.iter().position(|(key, _)| key == file_key) {
            Some(pos) => &mut self.files[pos].1,
            None => {
                self.files.push((file_key.to_string(), Vec::new()));
                let last = self.files.len() - 1;
                &mut self.files[last].1
            }
        };
        match runtimes.iter_mut().find(|(label, _)| label == runtime_label) {
            Some(slot) => slot.1 = Some(result),
            None => runtimes.push((runtime_label.to_string(), Some(result))),
        }
    }

    pub fn get(&self, file_key: &str, runtime_label: &str) -> Option<&ExecutionResult> {
        self.files
            .iter()
            .find(|(key, _)| key == file_key)?
            .1
            .iter()
            .find(|(label, _)| label == runtime_label)?
            .1
            .as_ref()
    }

    /// Settled results in plan order.
    pub fn results(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.entries().map(|(_, _, result)| result)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &ExecutionResult)> {
        self.files.iter().flat_map(|(file, runtimes)| {
            runtimes.iter().filter_map(move |(label, result)| {
                result.as_ref().map(|result| (file.as_str(), label.as_str(), result))
            })
        })
    }

    pub fn len(&self) -> usize {
        self.results().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct SettledRuntimes<'a>(&'a [(String, Option<ExecutionResult>)]);

impl Serialize for SettledRuntimes<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (label, result) in self.0 {
            if let Some(result) = result {
                map.serialize_entry(label, result)?;
            }
        }
        map.end()
    }
}

impl Serialize for TestPlanReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (file, runtimes) in &self.files {
            if runtimes.iter().any(|(_, result)| result.is_some()) {
                map.serialize_entry(file, &SettledRuntimes(runtimes))?;
            }
        }
        map.end()
    }
}
