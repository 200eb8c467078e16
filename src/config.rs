//! Runtime knobs for the container and the mediator.
//!
//! Every type deserializes with `serde`, so hosts can embed a [`CqrsConfig`] in their own
//! configuration files, or load it from `MINI_CQRS_*` environment variables.

use std::{fmt, str::FromStr};

use anyhow::{Error, anyhow};
use serde::{Deserialize, Serialize};

/// What happens when a service key is registered twice in the same collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationPolicy {
    /// The last registration wins.
    #[default]
    Replace,
    /// A second registration fails with `DuplicateRegistration`.
    Reject,
}

/// How `Mediator::publish` runs the handlers of one notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStrategy {
    /// One handler at a time, in registration order.
    #[default]
    Sequential,
    /// All handlers concurrently on the publishing task. Side effects are not ordered.
    Parallel,
}

/// How failing notification handlers are reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Attempt every handler, then report all failures together.
    #[default]
    ContinueOnError,
    /// Stop at the first failure.
    FailFast,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediatorConfig {
    pub publish_strategy: PublishStrategy,
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CqrsConfig {
    pub registration_policy: RegistrationPolicy,
    pub mediator: MediatorConfig,
}

impl CqrsConfig {
    pub const REGISTRATION_POLICY_VAR: &'static str = "MINI_CQRS_REGISTRATION_POLICY";
    pub const PUBLISH_STRATEGY_VAR: &'static str = "MINI_CQRS_PUBLISH_STRATEGY";
    pub const FAILURE_POLICY_VAR: &'static str = "MINI_CQRS_FAILURE_POLICY";

    /// Loads the configuration from the process environment, falling back to defaults.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(Self::REGISTRATION_POLICY_VAR) {
            config.registration_policy = value.parse()?;
        }
        if let Some(value) = lookup(Self::PUBLISH_STRATEGY_VAR) {
            config.mediator.publish_strategy = value.parse()?;
        }
        if let Some(value) = lookup(Self::FAILURE_POLICY_VAR) {
            config.mediator.failure_policy = value.parse()?;
        }

        Ok(config)
    }
}

macro_rules! config_enum_strings {
    ($Enum:ident { $($Variant:ident => $text:literal),* $(,)? }) => {
        impl FromStr for $Enum {
            type Err = Error;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($Enum::$Variant),)*
                    other => Err(anyhow!(
                        "unknown {} `{}`, expected one of: {}",
                        stringify!($Enum),
                        other,
                        [$($text),*].join(", ")
                    )),
                }
            }
        }

        impl fmt::Display for $Enum {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $($Enum::$Variant => f.write_str($text),)*
                }
            }
        }
    };
}

config_enum_strings!(RegistrationPolicy {
    Replace => "replace",
    Reject => "reject",
});

config_enum_strings!(PublishStrategy {
    Sequential => "sequential",
    Parallel => "parallel",
});

config_enum_strings!(FailurePolicy {
    ContinueOnError => "continue_on_error",
    FailFast => "fail_fast",
});
