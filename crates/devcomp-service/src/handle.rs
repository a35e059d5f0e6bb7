//! Opaque handle types.
//!
//! Every handle is a 64-bit id drawn from one monotonic counter in the
//! registry, so ids are unique across kinds and never reused.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn id(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $label, self.0)
            }
        }
    };
}

define_handle!(
    /// Reference to device-resident data.
    GlobalDataHandle,
    "data"
);
define_handle!(
    /// Reference to a compiled executable.
    ExecutionHandle,
    "executable"
);
define_handle!(
    /// Reference to one device of the platform.
    DeviceHandle,
    "device"
);
define_handle!(
    /// Reference to a point-to-point channel.
    ChannelHandle,
    "channel"
);
define_handle!(
    /// Reference to an in-flight or finished asynchronous execution.
    ExecutionToken,
    "execution"
);

/// Direction of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    #[default]
    DeviceToDevice,
    HostToDevice,
    DeviceToHost,
}
