use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::LiveSignalError;

/// Which MIDI channels have their Control Change and Program Change
/// messages processed.
///
/// Parsed from and printed as `"all"`, `"off"` or a channel number
/// `"0"`..`"15"`. Build a single-channel filter with
/// [`ChannelFilter::channel`] to have the range checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChannelFilter {
    #[default]
    All,
    Off,
    Channel(u8),
}

/// Highest MIDI channel number.
const MAX_CHANNEL: u8 = 15;

impl ChannelFilter {
    /// Filter for one channel in `0..=15`.
    pub fn channel(channel: u8) -> Result<Self, LiveSignalError> {
        let filter = Self::Channel(channel);
        filter.validate()?;
        Ok(filter)
    }

    /// Rejects a `Channel` outside `0..=15`.
    pub fn validate(&self) -> Result<(), LiveSignalError> {
        match *self {
            Self::Channel(channel) if channel > MAX_CHANNEL => Err(out_of_range(channel)),
            _ => Ok(()),
        }
    }

    /// Whether messages on `channel` pass the filter.
    pub fn accepts(&self, channel: u8) -> bool {
        match *self {
            Self::All => true,
            Self::Off => false,
            Self::Channel(wanted) => wanted == channel,
        }
    }
}

impl fmt::Display for ChannelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Off => f.write_str("off"),
            Self::Channel(channel) => write!(f, "{channel}"),
        }
    }
}

impl FromStr for ChannelFilter {
    type Err = LiveSignalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "all" => Ok(Self::All),
            "off" => Ok(Self::Off),
            other => other
                .parse::<u8>()
                .map_err(|_| out_of_range(other))
                .and_then(Self::channel),
        }
    }
}

fn out_of_range(value: impl fmt::Debug) -> LiveSignalError {
    LiveSignalError::InvalidConfig(format!(
        "channel filter must be \"all\", \"off\" or 0-15, got {value:?}"
    ))
}

impl TryFrom<String> for ChannelFilter {
    type Error = LiveSignalError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChannelFilter> for String {
    fn from(value: ChannelFilter) -> Self {
        value.to_string()
    }
}

/// Whether Timing Clock bytes pass through the channel filter.
///
/// Clock carries no channel. `FollowFilter` gates it on the low nibble of
/// the status byte (8 for `0xF8`), so `"off"` and any channel other than 8
/// drop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClockPolicy {
    #[default]
    BypassFilter,
    FollowFilter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truth_table() {
        for channel in 0..16 {
            assert!(ChannelFilter::All.accepts(channel));
            assert!(!ChannelFilter::Off.accepts(channel));
            assert_eq!(ChannelFilter::Channel(5).accepts(channel), channel == 5);
        }
    }

    #[test]
    fn parses_and_prints() {
        assert_eq!("all".parse::<ChannelFilter>().unwrap(), ChannelFilter::All);
        assert_eq!("off".parse::<ChannelFilter>().unwrap(), ChannelFilter::Off);
        assert_eq!(
            "15".parse::<ChannelFilter>().unwrap(),
            ChannelFilter::Channel(15)
        );
        assert!("16".parse::<ChannelFilter>().is_err());
        assert!("-1".parse::<ChannelFilter>().is_err());
        assert!("any".parse::<ChannelFilter>().is_err());
        assert_eq!(ChannelFilter::Channel(9).to_string(), "9");
    }

    #[test]
    fn channel_constructor_checks_range() {
        assert_eq!(ChannelFilter::channel(0).unwrap(), ChannelFilter::Channel(0));
        assert_eq!(ChannelFilter::channel(15).unwrap(), ChannelFilter::Channel(15));
        assert!(ChannelFilter::channel(16).is_err());
        assert!(ChannelFilter::Channel(200).validate().is_err());
        assert!(ChannelFilter::Off.validate().is_ok());
    }

    #[test]
    fn serialises_as_string() {
        let json = serde_json::to_string(&ChannelFilter::Channel(4)).unwrap();
        assert_eq!(json, "\"4\"");
        let filter: ChannelFilter = serde_json::from_str("\"off\"").unwrap();
        assert_eq!(filter, ChannelFilter::Off);
        assert!(serde_json::from_str::<ChannelFilter>("\"42\"").is_err());
    }
}
