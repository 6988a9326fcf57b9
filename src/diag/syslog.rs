//! Syslog sink.
//!
//! `openlog(3)` keeps the identity pointer it is given, so the identity is
//! stored in a process-wide cell and never freed. The first identity wins;
//! reconfiguring with another program name keeps the original one.

use std::ffi::{c_int, CString};
use std::sync::OnceLock;

use super::Severity;

static IDENT: OnceLock<CString> = OnceLock::new();

/// Known facility names, as accepted by `-y<facility>`.
const FACILITIES: &[(&str, c_int)] = &[
    ("auth", libc::LOG_AUTH),
    ("authpriv", libc::LOG_AUTHPRIV),
    ("cron", libc::LOG_CRON),
    ("daemon", libc::LOG_DAEMON),
    ("ftp", libc::LOG_FTP),
    ("kern", libc::LOG_KERN),
    ("local0", libc::LOG_LOCAL0),
    ("local1", libc::LOG_LOCAL1),
    ("local2", libc::LOG_LOCAL2),
    ("local3", libc::LOG_LOCAL3),
    ("local4", libc::LOG_LOCAL4),
    ("local5", libc::LOG_LOCAL5),
    ("local6", libc::LOG_LOCAL6),
    ("local7", libc::LOG_LOCAL7),
    ("lpr", libc::LOG_LPR),
    ("mail", libc::LOG_MAIL),
    ("news", libc::LOG_NEWS),
    ("syslog", libc::LOG_SYSLOG),
    ("user", libc::LOG_USER),
    ("uucp", libc::LOG_UUCP),
];

/// A syslog facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Facility(c_int);

impl Facility {
    /// `LOG_DAEMON`, the default.
    pub const DAEMON: Self = Self(libc::LOG_DAEMON);

    /// Looks a facility up by name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        FACILITIES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, code)| Self(code))
    }
}

impl Default for Facility {
    fn default() -> Self {
        Self::DAEMON
    }
}

fn priority(severity: Severity) -> c_int {
    match severity {
        Severity::Debug => libc::LOG_DEBUG,
        Severity::Info => libc::LOG_INFO,
        Severity::Notice => libc::LOG_NOTICE,
        Severity::Warning => libc::LOG_WARNING,
        Severity::Error => libc::LOG_ERR,
        Severity::Critical => libc::LOG_CRIT,
    }
}

/// Connection to the system logger.
#[derive(Debug)]
pub(crate) struct Syslog {
    facility: Facility,
}

impl Syslog {
    /// Calls `openlog` with `LOG_PID` under the given identity.
    pub(crate) fn open(progname: &str, facility: Facility) -> Self {
        let ident = IDENT.get_or_init(|| {
            CString::new(progname.replace('\0', "")).unwrap_or_default()
        });
        // SAFETY: `ident` lives in a static and is never dropped.
        unsafe { libc::openlog(ident.as_ptr(), libc::LOG_PID, facility.0) };
        Self { facility }
    }

    /// Sends one message. Failures are not reported anywhere.
    pub(crate) fn send(&self, severity: Severity, message: &str) {
        let Ok(text) = CString::new(message.replace('\0', "")) else {
            return;
        };
        // SAFETY: the format string is a constant "%s" and `text` is a valid
        // NUL-terminated string, so no caller data is interpreted as format.
        unsafe {
            libc::syslog(
                priority(severity) | self.facility.0,
                c"%s".as_ptr(),
                text.as_ptr(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facility_lookup() {
        assert_eq!(Facility::from_name("daemon"), Some(Facility::DAEMON));
        assert_eq!(Facility::from_name("LOCAL3"), Some(Facility(libc::LOG_LOCAL3)));
        assert_eq!(Facility::from_name("nosuch"), None);
    }

    #[test]
    fn test_priority_order_matches_severity() {
        assert_eq!(priority(Severity::Critical), libc::LOG_CRIT);
        assert_eq!(priority(Severity::Notice), libc::LOG_NOTICE);
    }
}
