//! Enum payloads with a fixed vocabulary.
//!
//! ```plain
//! switch     <- "on" | "off" | "toggle"
//! button     -> "pressed" | "released" | "clicked" | "double_clicked" | ...
//! cover      <- "open" | "close" | "stop" | "opening" | "closing" | "stopped"
//! connection -> "connected" | "disconnected" | "lost" | ...
//! ```

use core::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::PropertyValue;

macro_rules! payload {
    (
        $( #[ $meta:meta ] )*
        pub enum $ident:ident { $( $variant:ident => $name:literal ),* $(,)? }
    ) => {
        $( #[ $meta ] )*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $ident {
            $( #[serde(rename = $name)] $variant, )*
        }

        impl $ident {
            pub const ALL: &'static [&'static str] = &[$( $name ),*];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $ident::$variant => $name, )*
                }
            }
        }

        impl Display for $ident {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ident {
            type Err = &'static str;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $name => Ok($ident::$variant), )*
                    _ => Err(concat!("unknown ", stringify!($ident))),
                }
            }
        }

        impl From<$ident> for PropertyValue {
            fn from(value: $ident) -> Self {
                PropertyValue::Enum(value.as_str().to_owned())
            }
        }
    };
}

payload! {
    pub enum SwitchPayload {
        On => "on",
        Off => "off",
        Toggle => "toggle",
    }
}

payload! {
    pub enum ButtonPayload {
        Pressed => "pressed",
        Released => "released",
        Clicked => "clicked",
        DoubleClicked => "double_clicked",
        TripleClicked => "triple_clicked",
        LongClicked => "long_clicked",
        ExtraLongClicked => "extra_long_clicked",
    }
}

payload! {
    pub enum CoverPayload {
        Open => "open",
        Close => "close",
        Stop => "stop",
        Opening => "opening",
        Closing => "closing",
        Opened => "opened",
        Closed => "closed",
        Stopped => "stopped",
        Calibrating => "calibrating",
    }
}

payload! {
    /// Connection state of a connector or device, kept on its `state` property
    pub enum ConnectionState {
        Connected => "connected",
        Disconnected => "disconnected",
        Init => "init",
        Ready => "ready",
        Running => "running",
        Sleeping => "sleeping",
        Stopped => "stopped",
        Lost => "lost",
        Alert => "alert",
        Unknown => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_payload_format() {
        assert_eq!(serde_json::to_value(SwitchPayload::On).unwrap(), serde_json::json!("on"));
        assert_eq!(
            serde_json::to_value(SwitchPayload::Toggle).unwrap(),
            serde_json::json!("toggle")
        );
        assert_eq!("off".parse::<SwitchPayload>(), Ok(SwitchPayload::Off));
        assert_eq!("dim".parse::<SwitchPayload>(), Err("unknown SwitchPayload"));
    }

    #[test]
    fn into_property_value() {
        assert_eq!(
            PropertyValue::from(ConnectionState::Lost),
            PropertyValue::Enum("lost".to_owned())
        );
        assert_eq!(
            serde_json::from_value::<ButtonPayload>(serde_json::json!("double_clicked")).unwrap(),
            ButtonPayload::DoubleClicked
        );
    }
}
