//! Digital trigger conditions evaluated on decoded samples.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HostError;

/// Finds the first sample satisfying a trigger condition.
///
/// Implementations may keep state between calls, e.g. the previous sample for
/// edge conditions: batches are offered in stream order.
pub trait TriggerMatcher {
    /// Offset of the first matching sample in `samples`.
    fn check(&mut self, samples: &[u32]) -> Option<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Zero,
    One,
    Rising,
    Falling,
    Edge,
}

impl Condition {
    pub const fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(Condition::Zero),
            '1' => Some(Condition::One),
            'r' => Some(Condition::Rising),
            'f' => Some(Condition::Falling),
            'e' => Some(Condition::Edge),
            _ => None,
        }
    }

    pub const fn as_char(self) -> char {
        match self {
            Condition::Zero => '0',
            Condition::One => '1',
            Condition::Rising => 'r',
            Condition::Falling => 'f',
            Condition::Edge => 'e',
        }
    }
}

/// All conditions must hold on the same sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternTrigger {
    conditions: Vec<(u8, Condition)>,
    level_mask: u32,
    level_value: u32,
    rising: u32,
    falling: u32,
    edge: u32,
    previous: Option<u32>,
}

impl PatternTrigger {
    pub fn new(conditions: impl IntoIterator<Item = (u8, Condition)>) -> Result<Self, HostError> {
        let mut trigger = Self::default();
        for (channel, condition) in conditions {
            if channel >= 32 {
                return Err(HostError::TriggerSpec(format!("channel {channel}")));
            }
            let bit = 1u32 << channel;
            match condition {
                Condition::Zero => trigger.level_mask |= bit,
                Condition::One => {
                    trigger.level_mask |= bit;
                    trigger.level_value |= bit;
                }
                Condition::Rising => trigger.rising |= bit,
                Condition::Falling => trigger.falling |= bit,
                Condition::Edge => trigger.edge |= bit,
            }
            trigger.conditions.push((channel, condition));
        }
        if trigger.conditions.is_empty() {
            return Err(HostError::TriggerSpec(String::new()));
        }
        Ok(trigger)
    }

    pub fn conditions(&self) -> &[(u8, Condition)] {
        &self.conditions
    }

    /// Highest channel a condition refers to.
    pub fn highest_channel(&self) -> u8 {
        self.conditions.iter().map(|&(ch, _)| ch).max().unwrap_or(0)
    }

    fn needs_previous(&self) -> bool {
        (self.rising | self.falling | self.edge) != 0
    }

    fn matches(&self, previous: Option<u32>, sample: u32) -> bool {
        if sample & self.level_mask != self.level_value {
            return false;
        }
        if !self.needs_previous() {
            return true;
        }
        let Some(previous) = previous else {
            return false;
        };
        let changed = previous ^ sample;
        changed & sample & self.rising == self.rising
            && changed & !sample & self.falling == self.falling
            && changed & self.edge == self.edge
    }
}

impl TriggerMatcher for PatternTrigger {
    fn check(&mut self, samples: &[u32]) -> Option<usize> {
        for (idx, &sample) in samples.iter().enumerate() {
            let hit = self.matches(self.previous, sample);
            self.previous = Some(sample);
            if hit {
                return Some(idx);
            }
        }
        None
    }
}

/// `channel=condition` pairs separated by commas, e.g. `0=r,3=1`.
impl FromStr for PatternTrigger {
    type Err = HostError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = || HostError::TriggerSpec(spec.to_owned());
        let conditions = spec
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                let (channel, condition) = part.split_once('=').ok_or_else(invalid)?;
                let channel = channel.trim().parse::<u8>().map_err(|_| invalid())?;
                let mut chars = condition.trim().chars();
                let condition = match (chars.next(), chars.next()) {
                    (Some(c), None) => Condition::from_char(c).ok_or_else(invalid)?,
                    _ => return Err(invalid()),
                };
                Ok((channel, condition))
            })
            .collect::<Result<Vec<_>, HostError>>()?;
        Self::new(conditions).map_err(|_| invalid())
    }
}

impl fmt::Display for PatternTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, (channel, condition)) in self.conditions.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{channel}={}", condition.as_char())?;
        }
        Ok(())
    }
}
