//! C ABI shared by the host-side relay and add-in modules.
//!
//! Every add-in module exports exactly two symbols:
//! - `addinshim_abi_version`: a `u32` static that must equal [`ABI_VERSION`]
//! - `addinshim_lookup`: a [`LookupFn`] resolving `(type, method, signature)`
//!   to a function pointer, or null when the type has no such entry point
//!
//! The relay never links against the concrete add-in type. It binds the
//! five [`Method`]s below by name and signature tag instead.
//!
//! `create` also receives a [`HostLink`]: the isolation decision the host
//! already made, plus callbacks that carry user reports and log records
//! from the module's copy of this crate back to the host's.

use std::ffi::c_void;
use std::fmt;

/// Current add-in ABI version.
pub const ABI_VERSION: u32 = 2;

/// Symbol name of the exported ABI version static.
pub const ABI_VERSION_SYMBOL: &[u8] = b"addinshim_abi_version\0";

/// Symbol name of the exported lookup function.
pub const LOOKUP_SYMBOL: &[u8] = b"addinshim_lookup\0";

/// Opaque host site passed to `activate`.
///
/// The host owns whatever the pointer refers to; the shim only carries it
/// across the isolation boundary and drops its copy on deactivation.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteHandle(*mut c_void);

impl SiteHandle {
    pub const fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    pub fn from_raw(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

impl Default for SiteHandle {
    fn default() -> Self {
        Self::null()
    }
}

/// Raw status code returned by lifecycle entry points.
pub type RawStatus = i32;

pub const STATUS_OK: RawStatus = 0;
pub const STATUS_BINDING_FAILED: RawStatus = 1;
pub const STATUS_PANICKED: RawStatus = 2;

/// Decoded lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddinStatus {
    Ok,
    BindingFailed,
    Panicked,
    Unknown(RawStatus),
}

impl AddinStatus {
    pub fn from_raw(raw: RawStatus) -> Self {
        match raw {
            STATUS_OK => Self::Ok,
            STATUS_BINDING_FAILED => Self::BindingFailed,
            STATUS_PANICKED => Self::Panicked,
            other => Self::Unknown(other),
        }
    }

    pub fn into_raw(self) -> RawStatus {
        match self {
            Self::Ok => STATUS_OK,
            Self::BindingFailed => STATUS_BINDING_FAILED,
            Self::Panicked => STATUS_PANICKED,
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for AddinStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::BindingFailed => write!(f, "binding failed"),
            Self::Panicked => write!(f, "panicked"),
            Self::Unknown(raw) => write!(f, "unknown status {}", raw),
        }
    }
}

/// Host decided that add-ins run in private scopes.
pub const LINK_PRIVATE_SCOPES: u32 = 1;
/// Host decided that add-ins run where they were loaded, without scopes.
pub const LINK_PASS_THROUGH: u32 = 2;

/// Delivers a user report to the host. `stage` uses the codes of
/// `report::Stage`.
pub type ReportFn = unsafe extern "C" fn(
    reporter: *mut c_void,
    addin: *const u8,
    addin_len: usize,
    stage: u32,
    message: *const u8,
    message_len: usize,
);

/// Delivers one log record to the host. `level` is 1 (error) to 5 (trace).
pub type LogFn = unsafe extern "C" fn(
    level: u32,
    target: *const u8,
    target_len: usize,
    message: *const u8,
    message_len: usize,
);

/// What the host hands to `create`. Only borrowed for the duration of the
/// call; `reporter` must stay valid until the instance is destroyed.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostLink {
    /// [`LINK_PRIVATE_SCOPES`] or [`LINK_PASS_THROUGH`].
    pub capability: u32,
    pub reporter: *mut c_void,
    pub report: Option<ReportFn>,
    pub log: Option<LogFn>,
    /// Most verbose level the host wants forwarded, 0 for none.
    pub max_level: u32,
}

/// Constructs an instance. Arguments are the defining module path and the
/// load context name (empty for the default context), both UTF-8, and the
/// host link. A null link means a host that made no isolation decision.
pub type CreateFn = unsafe extern "C" fn(
    module_path: *const u8,
    module_len: usize,
    context: *const u8,
    context_len: usize,
    link: *const HostLink,
) -> *mut c_void;

/// `activate(site, first_time)` on an instance.
pub type ActivateFn =
    unsafe extern "C" fn(instance: *mut c_void, site: SiteHandle, first_time: bool) -> RawStatus;

/// Nullary lifecycle call (`deactivate`, `reset_interface`).
pub type NullaryFn = unsafe extern "C" fn(instance: *mut c_void) -> RawStatus;

/// Releases an instance created by [`CreateFn`].
pub type DestroyFn = unsafe extern "C" fn(instance: *mut c_void);

/// Resolves `(type_name, method, signature)` to an entry point.
pub type LookupFn = unsafe extern "C" fn(
    type_name: *const u8,
    type_len: usize,
    method: *const u8,
    method_len: usize,
    signature: *const u8,
    signature_len: usize,
) -> *const c_void;

/// Entry points an add-in type exposes across the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Create,
    Activate,
    Deactivate,
    ResetInterface,
    Destroy,
}

impl Method {
    pub const ALL: [Method; 5] = [
        Method::Create,
        Method::Activate,
        Method::Deactivate,
        Method::ResetInterface,
        Method::Destroy,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Method::Create => "create",
            Method::Activate => "activate",
            Method::Deactivate => "deactivate",
            Method::ResetInterface => "reset_interface",
            Method::Destroy => "destroy",
        }
    }

    /// Signature tag that must match on both sides of the boundary.
    pub fn signature(self) -> &'static str {
        match self {
            Method::Create => {
                "fn(*const u8, usize, *const u8, usize, *const HostLink) -> *mut c_void"
            }
            Method::Activate => "fn(*mut c_void, SiteHandle, bool) -> i32",
            Method::Deactivate | Method::ResetInterface => "fn(*mut c_void) -> i32",
            Method::Destroy => "fn(*mut c_void)",
        }
    }

    pub fn from_name(name: &str) -> Option<Method> {
        Method::ALL.into_iter().find(|m| m.name() == name)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Borrow a UTF-8 string passed as pointer and length.
///
/// Returns `None` for invalid UTF-8. A null pointer or zero length yields
/// the empty string.
///
/// # Safety
/// `ptr` must be valid for reads of `len` bytes for the returned lifetime.
pub unsafe fn str_from_raw<'a>(ptr: *const u8, len: usize) -> Option<&'a str> {
    if ptr.is_null() || len == 0 {
        return Some("");
    }
    let bytes = std::slice::from_raw_parts(ptr, len);
    std::str::from_utf8(bytes).ok()
}
