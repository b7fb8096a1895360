//! Surfacing contained add-in failures to the user.

use std::any::Any;
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

/// Lifecycle step a report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Activate,
    Deactivate,
    AddCustomization,
    RemoveCustomization,
    Binding,
}

impl Stage {
    /// Code used when a report crosses the C boundary.
    pub fn code(self) -> u32 {
        match self {
            Stage::Activate => 1,
            Stage::Deactivate => 2,
            Stage::AddCustomization => 3,
            Stage::RemoveCustomization => 4,
            Stage::Binding => 5,
        }
    }

    pub fn from_code(code: u32) -> Option<Stage> {
        match code {
            1 => Some(Stage::Activate),
            2 => Some(Stage::Deactivate),
            3 => Some(Stage::AddCustomization),
            4 => Some(Stage::RemoveCustomization),
            5 => Some(Stage::Binding),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Activate => "activate",
            Stage::Deactivate => "deactivate",
            Stage::AddCustomization => "add customization",
            Stage::RemoveCustomization => "remove customization",
            Stage::Binding => "binding",
        };
        f.write_str(name)
    }
}

/// A message meant for the person running the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserReport {
    pub addin: String,
    pub stage: Stage,
    pub message: String,
}

impl fmt::Display for UserReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed during {}: {}", self.addin, self.stage, self.message)
    }
}

/// Host-supplied sink for user-facing failure messages.
pub trait UserReporter: Send + Sync {
    fn report(&self, report: &UserReport);
}

/// Logs reports through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl UserReporter for TracingReporter {
    fn report(&self, report: &UserReport) {
        match report.stage {
            Stage::Binding => tracing::error!(addin = %report.addin, "{}", report),
            _ => tracing::warn!(addin = %report.addin, "{}", report),
        }
    }
}

/// Keeps reports in memory so a host can show them later.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    reports: Mutex<Vec<UserReport>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<UserReport> {
        self.reports.lock().clone()
    }

    pub fn take(&self) -> Vec<UserReport> {
        std::mem::take(&mut *self.reports.lock())
    }
}

impl UserReporter for CollectingReporter {
    fn report(&self, report: &UserReport) {
        self.reports.lock().push(report.clone());
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_display() {
        let report = UserReport {
            addin: "SampleAddin".to_string(),
            stage: Stage::AddCustomization,
            message: "ribbon missing".to_string(),
        };
        assert_eq!(
            report.to_string(),
            "SampleAddin failed during add customization: ribbon missing"
        );
    }

    #[test]
    fn test_stage_codes() {
        for stage in [
            Stage::Activate,
            Stage::Deactivate,
            Stage::AddCustomization,
            Stage::RemoveCustomization,
            Stage::Binding,
        ] {
            assert_eq!(Stage::from_code(stage.code()), Some(stage));
        }
        assert_eq!(Stage::from_code(0), None);
    }

    #[test]
    fn test_collecting_reporter_take() {
        let reporter = CollectingReporter::new();
        reporter.report(&UserReport {
            addin: "A".to_string(),
            stage: Stage::Activate,
            message: "boom".to_string(),
        });
        assert_eq!(reporter.reports().len(), 1);
        assert_eq!(reporter.take().len(), 1);
        assert!(reporter.reports().is_empty());
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload = std::panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 7");
    }
}
