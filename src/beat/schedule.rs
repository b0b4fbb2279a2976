//! Schedule entries and the table that owns them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::dispatcher::validate_name;
use crate::store::ScheduleState;
use crate::task::TaskOptions;

use super::ScheduleError;

/// Placeholder replaced by the RFC 3339 time of the slot being fired.
pub const SCHEDULED_FOR_PLACEHOLDER: &str = "{{scheduled_for}}";

/// Placeholder replaced by the entry name.
pub const ENTRY_PLACEHOLDER: &str = "{{entry}}";

/// Parsed cron expression.
#[derive(Clone)]
pub struct CronTrigger {
    expression: String,
    schedule: cron::Schedule,
}

impl CronTrigger {
    /// Parses a 5-field (minute precision) or 6/7-field (second precision)
    /// expression, evaluated in UTC.
    pub fn parse(expression: &str) -> Result<Self, String> {
        let field_count = expression.split_whitespace().count();
        let normalized = match field_count {
            5 => format!("0 {}", expression.trim()),
            6 | 7 => expression.trim().to_string(),
            n => return Err(format!("expected 5, 6 or 7 fields, got {}", n)),
        };

        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| e.to_string())?;
        Ok(Self {
            expression: normalized,
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }
}

impl fmt::Debug for CronTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronTrigger").field(&self.expression).finish()
    }
}

impl PartialEq for CronTrigger {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

/// When an entry fires.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Fixed cadence. Slots stay on the grid of the first slot.
    Interval(Duration),
    /// Cron expression in UTC.
    Cron(CronTrigger),
}

impl Trigger {
    /// Creates an interval trigger.
    pub fn every(interval: Duration) -> Self {
        Trigger::Interval(interval)
    }

    /// Parses a cron trigger.
    pub fn cron(expression: &str) -> Result<Self, String> {
        CronTrigger::parse(expression).map(Trigger::Cron)
    }

    /// First slot of an entry created at `now`.
    pub fn first_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval(interval) => Some(now + to_chrono(*interval)),
            Trigger::Cron(cron) => cron.next_after(now),
        }
    }

    /// Next slot after the one scheduled for `fired` was handled at `now`.
    ///
    /// Slots missed while the scheduler was down are skipped: the result is
    /// always later than `now`.
    pub fn next_after(&self, fired: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval(interval) => {
                let step = to_chrono(*interval).num_milliseconds().max(1);
                let elapsed = (now - fired).num_milliseconds().max(0);
                let slots = elapsed / step + 1;
                Some(fired + chrono::Duration::milliseconds(step.saturating_mul(slots)))
            }
            Trigger::Cron(cron) => cron.next_after(now.max(fired)),
        }
    }

    fn validate(&self, entry: &str) -> Result<(), ScheduleError> {
        match self {
            Trigger::Interval(interval) if interval.is_zero() => {
                Err(ScheduleError::InvalidInterval(entry.to_string()))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Interval(interval) => write!(f, "every {:?}", interval),
            Trigger::Cron(cron) => write!(f, "cron '{}'", cron.expression),
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

/// A recurring task.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub name: String,
    pub task_name: String,
    pub trigger: Trigger,
    /// Argument template. String values may contain
    /// [`SCHEDULED_FOR_PLACEHOLDER`] and [`ENTRY_PLACEHOLDER`].
    pub args: Value,
    pub queue: Option<String>,
    pub max_retries: Option<u32>,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    /// `None` once a cron expression has no further occurrences.
    pub next_run_at: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    /// Creates an enabled entry whose first slot follows `now`.
    pub fn new(
        name: impl Into<String>,
        task_name: impl Into<String>,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Self {
        let next_run_at = trigger.first_after(now);
        Self {
            name: name.into(),
            task_name: task_name.into(),
            trigger,
            args: Value::Array(Vec::new()),
            queue: None,
            max_retries: None,
            enabled: true,
            last_run_at: None,
            next_run_at,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Overrides the first slot.
    pub fn starting_at(mut self, next_run_at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(next_run_at);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Returns whether the entry should fire at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.map_or(false, |next| next <= now)
    }

    /// Arguments for the slot `scheduled_for`.
    pub fn render_args(&self, scheduled_for: DateTime<Utc>) -> Value {
        let slot = scheduled_for.to_rfc3339();
        render(&self.args, &slot, &self.name)
    }

    /// Submission options for the slot `scheduled_for`.
    ///
    /// The idempotency key is derived from the entry and the slot, so firing
    /// the same slot twice yields one task.
    pub fn task_options(&self, scheduled_for: DateTime<Utc>) -> TaskOptions {
        let mut options = TaskOptions::new().with_idempotency_key(firing_key(
            &self.name,
            scheduled_for,
        ));
        if let Some(queue) = &self.queue {
            options = options.with_queue(queue.clone());
        }
        if let Some(max_retries) = self.max_retries {
            options = options.with_max_retries(max_retries);
        }
        options
    }

    /// Moves the entry past the slot `fired`.
    pub fn advance(&mut self, fired: DateTime<Utc>, now: DateTime<Utc>) {
        self.last_run_at = Some(now);
        self.next_run_at = self.trigger.next_after(fired, now);
    }

    /// Persisted form of the run bookkeeping.
    pub fn state(&self) -> Option<ScheduleState> {
        self.next_run_at.map(|next_run_at| ScheduleState {
            entry: self.name.clone(),
            trigger: self.trigger.to_string(),
            last_run_at: self.last_run_at,
            next_run_at,
        })
    }

    fn validate(&self) -> Result<(), ScheduleError> {
        validate_name("schedule entry", &self.name)?;
        validate_name("task name", &self.task_name)?;
        if let Some(queue) = &self.queue {
            validate_name("queue", queue)?;
        }
        self.trigger.validate(&self.name)
    }
}

/// Idempotency key of one firing.
pub fn firing_key(entry: &str, scheduled_for: DateTime<Utc>) -> String {
    format!("beat:{}:{}", entry, scheduled_for.timestamp_millis())
}

fn render(value: &Value, slot: &str, entry: &str) -> Value {
    match value {
        Value::String(s) => Value::String(
            s.replace(SCHEDULED_FOR_PLACEHOLDER, slot)
                .replace(ENTRY_PLACEHOLDER, entry),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, slot, entry)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, slot, entry)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// The set of entries a beat scheduler evaluates.
///
/// Ordered by entry name so firings within a tick are deterministic.
#[derive(Debug, Clone, Default)]
pub struct ScheduleTable {
    entries: BTreeMap<String, ScheduleEntry>,
}

impl ScheduleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry or replaces the one with the same name.
    ///
    /// A replacement keeps the run bookkeeping of the old entry unless its
    /// trigger changed.
    pub fn upsert(&mut self, mut entry: ScheduleEntry) -> Result<(), ScheduleError> {
        entry.validate()?;

        if let Some(existing) = self.entries.get(&entry.name) {
            entry.last_run_at = existing.last_run_at;
            if existing.trigger == entry.trigger {
                entry.next_run_at = existing.next_run_at;
            }
        }

        self.entries.insert(entry.name.clone(), entry);
        Ok(())
    }

    /// Removes an entry.
    pub fn remove(&mut self, name: &str) -> Result<ScheduleEntry, ScheduleError> {
        self.entries
            .remove(name)
            .ok_or_else(|| ScheduleError::UnknownEntry(name.to_string()))
    }

    /// Enables or disables an entry.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), ScheduleError> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| ScheduleError::UnknownEntry(name.to_string()))?;
        entry.enabled = enabled;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ScheduleEntry> {
        self.entries.get(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut ScheduleEntry> {
        self.entries.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copies of all entries.
    pub fn snapshot(&self) -> Vec<ScheduleEntry> {
        self.entries.values().cloned().collect()
    }

    /// Names of the entries due at `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.is_due(now))
            .map(|e| e.name.clone())
            .collect()
    }

    /// Applies persisted run bookkeeping. Unknown entries are ignored.
    ///
    /// A persisted slot is only kept when it was computed from the entry's
    /// current trigger; otherwise the entry keeps the slot derived from its
    /// trigger and only the last run time is restored.
    ///
    /// Returns the number of entries whose next slot was restored.
    pub fn restore(&mut self, states: &[ScheduleState]) -> usize {
        let mut restored = 0;
        for state in states {
            let Some(entry) = self.entries.get_mut(&state.entry) else {
                continue;
            };
            entry.last_run_at = state.last_run_at;

            let trigger = entry.trigger.to_string();
            if state.trigger != trigger {
                info!(
                    entry = %entry.name,
                    persisted = %state.trigger,
                    current = %trigger,
                    "Trigger changed, dropping persisted slot"
                );
                continue;
            }
            entry.next_run_at = Some(state.next_run_at);
            restored += 1;
        }
        restored
    }

    /// Builds a table from a YAML schedule file.
    pub fn from_yaml_file(path: &Path, now: DateTime<Utc>) -> Result<Self, ScheduleError> {
        let content = std::fs::read_to_string(path).map_err(|e| ScheduleError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml_str(&content, now)
    }

    /// Builds a table from YAML text.
    pub fn from_yaml_str(content: &str, now: DateTime<Utc>) -> Result<Self, ScheduleError> {
        let file: ScheduleFile = serde_yaml::from_str(content)?;

        let mut table = Self::new();
        for raw in file.entries {
            if table.entries.contains_key(&raw.name) {
                return Err(ScheduleError::DuplicateEntry(raw.name));
            }
            table.upsert(raw.into_entry(now)?)?;
        }
        Ok(table)
    }
}

/// On-disk schedule format.
///
/// ```yaml
/// entries:
///   - name: sync-daily
///     task: sync.reservations
///     cron: "0 5 0 * * *"
///     args: { period: day }
///   - name: heartbeat
///     task: ops.ping
///     interval_secs: 300
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleFile {
    #[serde(default)]
    pub entries: Vec<EntrySpec>,
}

/// One entry of a schedule file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySpec {
    pub name: String,
    pub task: String,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default = "default_args")]
    pub args: Value,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_args() -> Value {
    Value::Array(Vec::new())
}

fn default_enabled() -> bool {
    true
}

impl EntrySpec {
    fn into_entry(self, now: DateTime<Utc>) -> Result<ScheduleEntry, ScheduleError> {
        let trigger = match (&self.cron, self.interval_secs) {
            (Some(expr), None) => {
                Trigger::cron(expr).map_err(|reason| ScheduleError::InvalidCron {
                    entry: self.name.clone(),
                    expression: expr.clone(),
                    reason,
                })?
            }
            (None, Some(secs)) => Trigger::every(Duration::from_secs(secs)),
            _ => return Err(ScheduleError::AmbiguousTrigger(self.name.clone())),
        };

        let mut entry = ScheduleEntry::new(self.name, self.task, trigger, now).with_args(self.args);
        entry.queue = self.queue;
        entry.max_retries = self.max_retries;
        entry.enabled = self.enabled;
        Ok(entry)
    }
}
