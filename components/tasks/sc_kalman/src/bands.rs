use serde::{Deserialize, Serialize};

fn default_warning_ratio() -> f64 {
    0.7
}

/// Severity of a reported metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Ok,
    Warning,
    Error,
}

/// Reporting band for a metric where larger is worse.
///
/// Bands only classify values for clients; they never feed back into the
/// filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub error: f64,
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,
}

impl Band {
    pub const fn new(error: f64) -> Self {
        Self {
            error,
            warning_ratio: 0.7,
        }
    }

    pub fn warning(&self) -> f64 {
        self.error * self.warning_ratio
    }

    pub fn classify(&self, value: f64) -> Level {
        if value > self.error {
            Level::Error
        } else if value > self.warning() {
            Level::Warning
        } else {
            Level::Ok
        }
    }
}
