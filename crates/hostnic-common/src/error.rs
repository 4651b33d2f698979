//! Common error types for hostnic.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`HostnicError`].
pub type HostnicResult<T> = Result<T, HostnicError>;

/// Errors raised while validating, provisioning or tearing down a NIC.
#[derive(Error, Diagnostic, Debug)]
pub enum HostnicError {
    /// Static misconfiguration of a device.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(hostnic::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// A config field failed its type or format check.
    #[error("Invalid value for device option \"{field}\" (\"{value}\"): {reason}")]
    #[diagnostic(code(hostnic::config::invalid_field))]
    InvalidField {
        /// The offending field.
        field: String,
        /// The raw value supplied.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A config field is not known to this device type.
    #[error("Invalid device option: {field}")]
    #[diagnostic(
        code(hostnic::config::unknown_field),
        help("Remove the option or check its spelling")
    )]
    UnknownField {
        /// The unrecognized field.
        field: String,
    },

    /// A required config field is absent.
    #[error("Required device property \"{field}\" is missing")]
    #[diagnostic(code(hostnic::config::missing_field))]
    MissingField {
        /// The missing field.
        field: String,
    },

    /// The device type cannot be attached to this kind of instance.
    #[error("Unsupported device type for instance kind: {kind}")]
    #[diagnostic(code(hostnic::config::unsupported_instance))]
    UnsupportedInstance {
        /// The instance kind.
        kind: String,
    },

    /// A host precondition is not met.
    #[error("{message}")]
    #[diagnostic(
        code(hostnic::environment),
        help("Fix the host or the device config, then start the instance again")
    )]
    Environment {
        /// The error message.
        message: String,
    },

    /// A host-side provisioning step failed; completed steps were rolled back.
    #[error("Failed to {step}: {source}")]
    #[diagnostic(code(hostnic::provisioning))]
    Provisioning {
        /// The step that failed.
        step: String,
        /// The underlying failure.
        #[source]
        source: Box<HostnicError>,
    },

    /// One or more best-effort teardown steps failed.
    #[error("Teardown incomplete: {}", join_messages(.errors))]
    #[diagnostic(code(hostnic::teardown))]
    Teardown {
        /// Every failure, in the order the steps ran.
        #[related]
        errors: Vec<HostnicError>,
    },

    /// An external program exited unsuccessfully.
    #[error("Command \"{program} {}\" failed: {stderr}", .args.join(" "))]
    #[diagnostic(code(hostnic::command))]
    Command {
        /// The program that was run.
        program: String,
        /// Its arguments.
        args: Vec<String>,
        /// Captured standard error.
        stderr: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(hostnic::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(hostnic::serialization))]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(hostnic::internal),
        help("This is a bug, please report it at https://github.com/fishmindlabs360/hostnic/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl HostnicError {
    /// Wrap an error with the provisioning step that produced it.
    #[must_use]
    pub fn provisioning(step: impl Into<String>, source: Self) -> Self {
        Self::Provisioning {
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// Whether this is a static configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::InvalidField { .. }
                | Self::UnknownField { .. }
                | Self::MissingField { .. }
                | Self::UnsupportedInstance { .. }
        )
    }

    /// Whether this is an unmet host precondition.
    #[must_use]
    pub const fn is_environment(&self) -> bool {
        matches!(self, Self::Environment { .. })
    }

    /// Whether this is a failed (and rolled back) provisioning step.
    #[must_use]
    pub const fn is_provisioning(&self) -> bool {
        matches!(self, Self::Provisioning { .. })
    }

    /// Whether this is an aggregated teardown failure.
    #[must_use]
    pub const fn is_teardown(&self) -> bool {
        matches!(self, Self::Teardown { .. })
    }
}

impl From<serde_json::Error> for HostnicError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

fn join_messages(errors: &[HostnicError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
