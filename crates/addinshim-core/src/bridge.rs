//! Carrying user reports and log records across the module boundary.
//!
//! A module loaded into its own scope has its own copy of this crate, and
//! with it its own `tracing` dispatcher and no subscriber. The host side
//! builds a [`HostLink`] pointing at its reporter and at [`forward_log`];
//! the module side reports through [`LinkedReporter`] and installs a
//! subscriber that hands every record back to the host.

use std::fmt::{self, Write as _};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::level_filters::LevelFilter;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use crate::abi::{str_from_raw, HostLink, LogFn, ReportFn};
use crate::registry::IsolationCapability;
use crate::report::{Stage, UserReport, UserReporter};

/// Target of records forwarded from add-in modules.
pub const ADDIN_LOG_TARGET: &str = "addinshim_core::addin";

/// Host half of a link. Owns the reporter the module reports into, so it
/// must outlive the instance created with [`HostBridge::link`].
pub(crate) struct HostBridge {
    capability: IsolationCapability,
    reporter: Box<Arc<dyn UserReporter>>,
}

impl HostBridge {
    pub(crate) fn new(capability: IsolationCapability, reporter: Arc<dyn UserReporter>) -> Self {
        Self {
            capability,
            reporter: Box::new(reporter),
        }
    }

    pub(crate) fn link(&self) -> HostLink {
        let reporter: *const Arc<dyn UserReporter> = &*self.reporter;
        HostLink {
            capability: self.capability.to_raw(),
            reporter: reporter as *mut _,
            report: Some(forward_report),
            log: Some(forward_log),
            max_level: level_code(LevelFilter::current()),
        }
    }
}

unsafe extern "C" fn forward_report(
    reporter: *mut std::ffi::c_void,
    addin: *const u8,
    addin_len: usize,
    stage: u32,
    message: *const u8,
    message_len: usize,
) {
    if reporter.is_null() {
        return;
    }
    let reporter = &*(reporter as *const Arc<dyn UserReporter>);
    let (Some(addin), Some(stage), Some(message)) = (
        str_from_raw(addin, addin_len),
        Stage::from_code(stage),
        str_from_raw(message, message_len),
    ) else {
        tracing::warn!("Dropped a malformed report from an add-in module");
        return;
    };

    let report = UserReport {
        addin: addin.to_string(),
        stage,
        message: message.to_string(),
    };
    if panic::catch_unwind(AssertUnwindSafe(|| reporter.report(&report))).is_err() {
        tracing::error!("User reporter panicked on: {}", report);
    }
}

/// Re-emit a record from an add-in module through the host's subscriber.
pub(crate) unsafe extern "C" fn forward_log(
    level: u32,
    target: *const u8,
    target_len: usize,
    message: *const u8,
    message_len: usize,
) {
    let (Some(origin), Some(message)) = (
        str_from_raw(target, target_len),
        str_from_raw(message, message_len),
    ) else {
        return;
    };

    match level {
        1 => tracing::error!(target: ADDIN_LOG_TARGET, origin = %origin, "{}", message),
        2 => tracing::warn!(target: ADDIN_LOG_TARGET, origin = %origin, "{}", message),
        3 => tracing::info!(target: ADDIN_LOG_TARGET, origin = %origin, "{}", message),
        4 => tracing::debug!(target: ADDIN_LOG_TARGET, origin = %origin, "{}", message),
        _ => tracing::trace!(target: ADDIN_LOG_TARGET, origin = %origin, "{}", message),
    }
}

fn level_code(filter: LevelFilter) -> u32 {
    match filter.into_level() {
        None => 0,
        Some(Level::ERROR) => 1,
        Some(Level::WARN) => 2,
        Some(Level::INFO) => 3,
        Some(Level::DEBUG) => 4,
        Some(_) => 5,
    }
}

fn level_filter(code: u32) -> LevelFilter {
    match code {
        0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3 => LevelFilter::INFO,
        4 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Module half: reports go to the host's reporter.
pub(crate) struct LinkedReporter {
    reporter: *mut std::ffi::c_void,
    report: ReportFn,
}

// The host keeps its reporter alive for the instance's lifetime, and
// `UserReporter` implementations are `Send + Sync`.
unsafe impl Send for LinkedReporter {}
unsafe impl Sync for LinkedReporter {}

impl LinkedReporter {
    pub(crate) fn from_link(link: &HostLink) -> Option<Self> {
        let report = link.report?;
        if link.reporter.is_null() {
            return None;
        }
        Some(Self {
            reporter: link.reporter,
            report,
        })
    }
}

impl UserReporter for LinkedReporter {
    fn report(&self, report: &UserReport) {
        unsafe {
            (self.report)(
                self.reporter,
                report.addin.as_ptr(),
                report.addin.len(),
                report.stage.code(),
                report.message.as_ptr(),
                report.message.len(),
            )
        }
    }
}

/// Install a subscriber in this copy of the crate that forwards records to
/// the host. No-op when the link points back at this same copy, or when a
/// subscriber is already installed.
pub(crate) fn forward_logs(link: &HostLink) {
    let Some(log) = link.log else {
        return;
    };
    if log as usize == forward_log as LogFn as usize {
        return;
    }

    let layer = ForwardLayer { log }.with_filter(level_filter(link.max_level));
    let subscriber = tracing_subscriber::registry().with(layer);
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        tracing::debug!("Forwarding add-in logs to the host");
    }
}

struct ForwardLayer {
    log: LogFn,
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut record = RecordText::default();
        event.record(&mut record);
        let text = record.finish();

        let metadata = event.metadata();
        let level = level_code(LevelFilter::from_level(*metadata.level()));
        let target = metadata.target();
        unsafe {
            (self.log)(level, target.as_ptr(), target.len(), text.as_ptr(), text.len());
        }
    }
}

/// Message followed by `key=value` fields.
#[derive(Default)]
struct RecordText {
    message: String,
    fields: String,
}

impl RecordText {
    fn finish(mut self) -> String {
        if self.message.is_empty() {
            return self.fields.trim_start().to_string();
        }
        self.message.push_str(&self.fields);
        self.message
    }
}

impl Visit for RecordText {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
