use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// Longest suite lifetime accepted by [`SuiteSpecBuilder::build`]: 30 days.
pub const MAX_TIMEOUT_MINS: u64 = 30 * 24 * 60;

/// Named suite priority levels. Lower values run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum Priority {
    Super,
    Cq,
    Pfq,
    Build,
    Default,
    PostBuild,
    Daily,
    Weekly,
}

impl Priority {
    /// All levels, highest priority first.
    pub const ALL: [Priority; 8] = [
        Priority::Super,
        Priority::Cq,
        Priority::Pfq,
        Priority::Build,
        Priority::Default,
        Priority::PostBuild,
        Priority::Daily,
        Priority::Weekly,
    ];

    pub fn value(self) -> i32 {
        match self {
            Priority::Super => 49,
            Priority::Cq => 50,
            Priority::Pfq => 80,
            Priority::Build => 110,
            Priority::Default => 140,
            Priority::PostBuild => 170,
            Priority::Daily => 200,
            Priority::Weekly => 230,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Priority::Super => "Super",
            Priority::Cq => "CQ",
            Priority::Pfq => "PFQ",
            Priority::Build => "Build",
            Priority::Default => "Default",
            Priority::PostBuild => "PostBuild",
            Priority::Daily => "Daily",
            Priority::Weekly => "Weekly",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.value())
    }
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority.value()
    }
}

impl TryFrom<i32> for Priority {
    type Error = SchedulerError;

    fn try_from(value: i32) -> Result<Self> {
        Priority::ALL
            .into_iter()
            .find(|p| p.value() == value)
            .ok_or_else(|| SchedulerError::UnknownPriority(value.to_string()))
    }
}

impl std::str::FromStr for Priority {
    type Err = SchedulerError;

    /// Accepts a level name (case-insensitive) or its numeric value.
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(value) = s.trim().parse::<i32>() {
            return Priority::try_from(value);
        }
        Priority::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SchedulerError::UnknownPriority(s.to_string()))
    }
}

/// Immutable description of one suite run.
///
/// Built through [`SuiteSpecBuilder`], which enforces `minimum_duts >= 1`, a
/// non-empty suite name and at least one board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuiteSpec {
    builds: BTreeMap<String, String>,
    suite_name: String,
    priority: Priority,
    pool: String,
    minimum_duts: usize,
    timeout_mins: u64,
    max_retries: u32,
    test_retry: bool,
    job_keyvals: BTreeMap<String, String>,
}

impl SuiteSpec {
    pub fn builder(suite_name: impl Into<String>) -> SuiteSpecBuilder {
        SuiteSpecBuilder::new(suite_name)
    }

    /// Board to build id
    pub fn builds(&self) -> &BTreeMap<String, String> {
        &self.builds
    }

    pub fn suite_name(&self) -> &str {
        &self.suite_name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn minimum_duts(&self) -> usize {
        self.minimum_duts
    }

    pub fn timeout_mins(&self) -> u64 {
        self.timeout_mins
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn test_retry(&self) -> bool {
        self.test_retry
    }

    pub fn job_keyvals(&self) -> &BTreeMap<String, String> {
        &self.job_keyvals
    }
}

#[derive(Debug, Clone)]
pub struct SuiteSpecBuilder {
    builds: BTreeMap<String, String>,
    suite_name: String,
    priority: Priority,
    pool: String,
    minimum_duts: usize,
    timeout_mins: u64,
    max_retries: u32,
    test_retry: bool,
    job_keyvals: BTreeMap<String, String>,
}

impl SuiteSpecBuilder {
    pub fn new(suite_name: impl Into<String>) -> Self {
        Self {
            builds: BTreeMap::new(),
            suite_name: suite_name.into(),
            priority: Priority::Default,
            pool: "suites".to_string(),
            minimum_duts: 1,
            timeout_mins: 90,
            max_retries: 0,
            test_retry: false,
            job_keyvals: BTreeMap::new(),
        }
    }

    pub fn build_for(mut self, board: impl Into<String>, build: impl Into<String>) -> Self {
        self.builds.insert(board.into(), build.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    pub fn minimum_duts(mut self, minimum_duts: usize) -> Self {
        self.minimum_duts = minimum_duts;
        self
    }

    pub fn timeout_mins(mut self, timeout_mins: u64) -> Self {
        self.timeout_mins = timeout_mins;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn test_retry(mut self, test_retry: bool) -> Self {
        self.test_retry = test_retry;
        self
    }

    pub fn job_keyval(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.job_keyvals.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<SuiteSpec> {
        if self.suite_name.trim().is_empty() {
            return Err(SchedulerError::InvalidSuiteSpec(
                "suite name must not be empty".to_string(),
            ));
        }
        if self.builds.is_empty() {
            return Err(SchedulerError::InvalidSuiteSpec(
                "at least one board/build pair is required".to_string(),
            ));
        }
        if self.minimum_duts < 1 {
            return Err(SchedulerError::InvalidSuiteSpec(
                "minimum_duts must be at least 1".to_string(),
            ));
        }
        if self.timeout_mins == 0 {
            return Err(SchedulerError::InvalidSuiteSpec(
                "timeout_mins must be positive".to_string(),
            ));
        }
        if self.timeout_mins > MAX_TIMEOUT_MINS {
            return Err(SchedulerError::InvalidSuiteSpec(format!(
                "timeout_mins must be at most {}, got {}",
                MAX_TIMEOUT_MINS, self.timeout_mins
            )));
        }

        Ok(SuiteSpec {
            builds: self.builds,
            suite_name: self.suite_name,
            priority: self.priority,
            pool: self.pool,
            minimum_duts: self.minimum_duts,
            timeout_mins: self.timeout_mins,
            max_retries: self.max_retries,
            test_retry: self.test_retry,
            job_keyvals: self.job_keyvals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_values_are_ordered() {
        let values: Vec<i32> = Priority::ALL.iter().map(|p| p.value()).collect();
        let mut sorted = values.clone();
        sorted.sort();
        assert_eq!(values, sorted);
        assert_eq!(Priority::Default.value(), 140);
        assert_eq!(Priority::Super.value(), 49);
    }

    #[test]
    fn priority_parses_names_and_values() {
        assert_eq!("CQ".parse::<Priority>().unwrap(), Priority::Cq);
        assert_eq!("postbuild".parse::<Priority>().unwrap(), Priority::PostBuild);
        assert_eq!("230".parse::<Priority>().unwrap(), Priority::Weekly);
        assert_eq!(Priority::try_from(80).unwrap(), Priority::Pfq);
    }

    #[test]
    fn priority_rejects_undeclared_levels() {
        assert!(matches!(
            Priority::try_from(141),
            Err(SchedulerError::UnknownPriority(_))
        ));
        assert!("Urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn priority_serializes_as_integer() {
        let json = serde_json::to_string(&Priority::Build).unwrap();
        assert_eq!(json, "110");
        let back: Priority = serde_json::from_str("50").unwrap();
        assert_eq!(back, Priority::Cq);
        assert!(serde_json::from_str::<Priority>("51").is_err());
    }

    #[test]
    fn builder_defaults() {
        let spec = SuiteSpec::builder("bvt-inline")
            .build_for("eve", "eve-release/R90-13816.0.0")
            .build()
            .unwrap();
        assert_eq!(spec.suite_name(), "bvt-inline");
        assert_eq!(spec.pool(), "suites");
        assert_eq!(spec.priority(), Priority::Default);
        assert_eq!(spec.minimum_duts(), 1);
        assert_eq!(spec.timeout_mins(), 90);
        assert_eq!(spec.max_retries(), 0);
        assert!(!spec.test_retry());
        assert!(spec.job_keyvals().is_empty());
    }

    #[test]
    fn builder_rejects_zero_minimum_duts() {
        let result = SuiteSpec::builder("bvt")
            .build_for("eve", "R90")
            .minimum_duts(0)
            .build();
        assert!(matches!(result, Err(SchedulerError::InvalidSuiteSpec(_))));
    }

    #[test]
    fn builder_bounds_timeout() {
        let build = |mins| {
            SuiteSpec::builder("bvt")
                .build_for("eve", "R90")
                .timeout_mins(mins)
                .build()
        };
        assert_eq!(build(MAX_TIMEOUT_MINS).unwrap().timeout_mins(), MAX_TIMEOUT_MINS);
        for mins in [0, MAX_TIMEOUT_MINS + 1, u64::MAX / 60 + 1, u64::MAX] {
            assert!(matches!(build(mins), Err(SchedulerError::InvalidSuiteSpec(_))));
        }
    }

    #[test]
    fn builder_requires_a_build() {
        let result = SuiteSpec::builder("bvt").build();
        assert!(matches!(result, Err(SchedulerError::InvalidSuiteSpec(_))));
    }

    #[test]
    fn builder_requires_a_name() {
        let result = SuiteSpec::builder("  ").build_for("eve", "R90").build();
        assert!(matches!(result, Err(SchedulerError::InvalidSuiteSpec(_))));
    }
}
