//! The closed set of deferrable operations.
//!
//! Every operation carries a [`CallKind`] tag that decides what the façade
//! hands back to the caller. The façade consults this table in one generic
//! dispatch routine instead of hand-writing a proxy per operation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PreInitError;

/// What the caller of a deferred operation gets back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    /// A pending result that settles with the engine's return value or failure.
    Deferred,
    /// The façade itself, for fluent registration-style calls.
    /// Completion is not observable to the caller.
    Chainable,
    /// Nothing. The call is started and its failure only logged.
    FireAndForget,
}

macro_rules! operations {
    ($( $variant:ident => $wire:literal, $kind:ident; )+) => {
        /// A named engine action that may be invoked before the engine exists.
        ///
        /// Serializes to (and parses from) the wire name used by snippet logs,
        /// e.g. `Operation::AddSourceMiddleware` ⇄ `"addSourceMiddleware"`.
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub enum Operation {
            $(
                #[serde(rename = $wire)]
                $variant,
            )+
        }

        impl Operation {
            /// Every deferrable operation, in table order.
            pub const ALL: &'static [Operation] = &[$(Operation::$variant),+];

            /// The wire name, as written by snippet logs.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Operation::$variant => $wire,)+
                }
            }

            /// How the façade proxies this operation.
            pub fn kind(self) -> CallKind {
                match self {
                    $(Operation::$variant => CallKind::$kind,)+
                }
            }
        }

        impl FromStr for Operation {
            type Err = PreInitError;

            fn from_str(name: &str) -> Result<Self, Self::Err> {
                match name {
                    $($wire => Ok(Operation::$variant),)+
                    other => Err(PreInitError::UnknownOperation {
                        name: other.to_string(),
                    }),
                }
            }
        }
    };
}

operations! {
    TrackSubmit => "trackSubmit", Deferred;
    TrackClick => "trackClick", Deferred;
    TrackLink => "trackLink", Deferred;
    TrackForm => "trackForm", Deferred;
    PageView => "pageview", Deferred;
    Identify => "identify", Deferred;
    Reset => "reset", Deferred;
    Group => "group", Deferred;
    Track => "track", Deferred;
    Ready => "ready", Deferred;
    Alias => "alias", Deferred;
    Debug => "debug", Chainable;
    Page => "page", Deferred;
    Once => "once", Chainable;
    Off => "off", Chainable;
    On => "on", Chainable;
    AddSourceMiddleware => "addSourceMiddleware", Deferred;
    AddIntegrationMiddleware => "addIntegrationMiddleware", Deferred;
    SetAnonymousId => "setAnonymousId", Deferred;
    AddDestinationMiddleware => "addDestinationMiddleware", Deferred;
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
