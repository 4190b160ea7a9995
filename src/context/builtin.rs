//! Context definitions shipped with the engine
//!
//! Platform-specific definitions (a player's world, dimension, ...) live with
//! the platform integration. These cover the value types that need no game API:
//! plain strings, enums, IP networks and time windows.

use std::fmt;
use std::marker::PhantomData;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use ipnet::IpNet;

use super::ContextDefinition;
use crate::subject::CalculatedSubject;

/// Context key reporting the configured server tags
pub const SERVER_TAG_CONTEXT: &str = "server-tag";

type ValueProvider<T> = Arc<dyn Fn(&CalculatedSubject) -> Vec<T> + Send + Sync>;

/// Free-form string context compared by equality
#[derive(Clone)]
pub struct SimpleContextDefinition {
    name: String,
    current: Option<ValueProvider<String>>,
}

impl fmt::Debug for SimpleContextDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleContextDefinition")
            .field("name", &self.name)
            .field("current", &self.current.is_some())
            .finish()
    }
}

impl SimpleContextDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current: None,
        }
    }

    /// Supply current values from the subject (typically via its associated object)
    pub fn with_current<F>(mut self, provider: F) -> Self
    where
        F: Fn(&CalculatedSubject) -> Vec<String> + Send + Sync + 'static,
    {
        self.current = Some(Arc::new(provider));
        self
    }

    /// A definition whose current values are the same for every subject
    pub fn fixed(name: impl Into<String>, values: Vec<String>) -> Self {
        Self::new(name).with_current(move |_| values.clone())
    }
}

impl ContextDefinition for SimpleContextDefinition {
    type Value = String;

    fn name(&self) -> &str {
        &self.name
    }

    fn serialize(&self, value: &String) -> String {
        value.clone()
    }

    fn deserialize(&self, raw: &str) -> Option<String> {
        Some(raw.to_string())
    }

    fn matches(&self, own: &String, test: &String) -> bool {
        own == test
    }

    fn accumulate_current_values(
        &self,
        subject: &CalculatedSubject,
        consumer: &mut dyn FnMut(String),
    ) {
        if let Some(ref provider) = self.current {
            provider(subject).into_iter().for_each(consumer);
        }
    }
}

/// Context restricted to the values of an enum-like type
pub struct EnumContextDefinition<E> {
    name: String,
    current: Option<ValueProvider<E>>,
    _marker: PhantomData<fn() -> E>,
}

impl<E> EnumContextDefinition<E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current: None,
            _marker: PhantomData,
        }
    }

    pub fn with_current<F>(mut self, provider: F) -> Self
    where
        F: Fn(&CalculatedSubject) -> Vec<E> + Send + Sync + 'static,
    {
        self.current = Some(Arc::new(provider));
        self
    }
}

impl<E> ContextDefinition for EnumContextDefinition<E>
where
    E: FromStr + fmt::Display + PartialEq + Send + Sync + 'static,
{
    type Value = E;

    fn name(&self) -> &str {
        &self.name
    }

    fn serialize(&self, value: &E) -> String {
        value.to_string()
    }

    fn deserialize(&self, raw: &str) -> Option<E> {
        raw.parse().ok()
    }

    fn matches(&self, own: &E, test: &E) -> bool {
        own == test
    }

    fn accumulate_current_values(&self, subject: &CalculatedSubject, consumer: &mut dyn FnMut(E)) {
        if let Some(ref provider) = self.current {
            provider(subject).into_iter().for_each(consumer);
        }
    }
}

/// IP network context: a stored network matches any address inside it
#[derive(Clone)]
pub struct IpSetContextDefinition {
    name: String,
    current: Option<ValueProvider<IpNet>>,
}

impl IpSetContextDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current: None,
        }
    }

    pub fn with_current<F>(mut self, provider: F) -> Self
    where
        F: Fn(&CalculatedSubject) -> Vec<IpNet> + Send + Sync + 'static,
    {
        self.current = Some(Arc::new(provider));
        self
    }
}

impl ContextDefinition for IpSetContextDefinition {
    type Value = IpNet;

    fn name(&self) -> &str {
        &self.name
    }

    fn serialize(&self, value: &IpNet) -> String {
        value.to_string()
    }

    fn deserialize(&self, raw: &str) -> Option<IpNet> {
        let raw = raw.trim();
        raw.parse::<IpNet>()
            .ok()
            .or_else(|| raw.parse::<IpAddr>().ok().map(IpNet::from))
    }

    fn matches(&self, own: &IpNet, test: &IpNet) -> bool {
        own.contains(test)
    }

    fn is_filter(&self) -> bool {
        true
    }

    fn accumulate_current_values(
        &self,
        subject: &CalculatedSubject,
        consumer: &mut dyn FnMut(IpNet),
    ) {
        if let Some(ref provider) = self.current {
            provider(subject).into_iter().for_each(consumer);
        }
    }
}

/// Which side of a stored instant a time context accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeComparison {
    /// `before=<t>` applies while the current time is earlier than `t`
    Before,
    /// `after=<t>` applies once the current time is later than `t`
    After,
}

/// Time-window context (`before` / `after`)
///
/// Values are RFC 3339 timestamps or unix seconds; the current value is "now".
#[derive(Clone)]
pub struct TimeContextDefinition {
    comparison: TimeComparison,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl TimeContextDefinition {
    pub fn before() -> Self {
        Self::new(TimeComparison::Before)
    }

    pub fn after() -> Self {
        Self::new(TimeComparison::After)
    }

    fn new(comparison: TimeComparison) -> Self {
        Self {
            comparison,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the clock used for current values
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }
}

impl ContextDefinition for TimeContextDefinition {
    type Value = DateTime<Utc>;

    fn name(&self) -> &str {
        match self.comparison {
            TimeComparison::Before => "before",
            TimeComparison::After => "after",
        }
    }

    fn serialize(&self, value: &DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    fn deserialize(&self, raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        raw.parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }

    fn matches(&self, own: &DateTime<Utc>, test: &DateTime<Utc>) -> bool {
        match self.comparison {
            TimeComparison::Before => test < own,
            TimeComparison::After => test > own,
        }
    }

    fn is_filter(&self) -> bool {
        true
    }

    fn accumulate_current_values(
        &self,
        _subject: &CalculatedSubject,
        consumer: &mut dyn FnMut(DateTime<Utc>),
    ) {
        consumer((self.clock)());
    }
}
