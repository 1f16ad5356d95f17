use std::{collections::BTreeMap, fmt, path::PathBuf};

use crondeck_notify::{Webhook, WebhookKind};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    cascade::Outcome,
    command::tokenize,
    error::{Result, SchedulerError},
    schedule::parse_cron,
};

/// A value that must never be written out in plaintext.
///
/// Deserializes from a plain string; serializes (and debug-prints) as `***`.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub const MASK: &'static str = "***";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The real value, for handing to a child process.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(Self::MASK)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", Self::MASK)
    }
}

/// Program plus arguments. In YAML either a list or a single string that is
/// split shell-style.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CommandLine(Vec<String>);

impl CommandLine {
    pub fn new(args: Vec<String>) -> Self {
        Self(args)
    }

    pub fn parse(line: &str) -> Result<Self> {
        tokenize(line).map(Self)
    }

    pub fn args(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for CommandLine {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Line(String),
            Args(Vec<String>),
        }

        match Raw::deserialize(d)? {
            Raw::Line(line) => CommandLine::parse(&line).map_err(serde::de::Error::custom),
            Raw::Args(args) => Ok(CommandLine(args)),
        }
    }
}

/// Reactions to one kind of run outcome: jobs to start and endpoints to
/// notify, one list per payload flavor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnEvent {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trigger_job: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify_webhook: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify_slack_webhook: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify_discord_webhook: Vec<String>,
}

impl OnEvent {
    pub fn is_empty(&self) -> bool {
        self.trigger_job.is_empty()
            && self.notify_webhook.is_empty()
            && self.notify_slack_webhook.is_empty()
            && self.notify_discord_webhook.is_empty()
    }

    /// Every configured endpoint, tagged with its payload flavor.
    pub fn webhooks(&self) -> impl Iterator<Item = Webhook> + '_ {
        tagged(WebhookKind::Generic, &self.notify_webhook)
            .chain(tagged(WebhookKind::Slack, &self.notify_slack_webhook))
            .chain(tagged(WebhookKind::Discord, &self.notify_discord_webhook))
    }
}

fn tagged(kind: WebhookKind, urls: &[String]) -> impl Iterator<Item = Webhook> + '_ {
    urls.iter().map(move |url| Webhook::new(kind, url.clone()))
}

/// One entry under `jobs:` in a schedule document. The name is the map key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default)]
    pub command: CommandLine,
    /// Extra attempts after a failure; 0 means a single attempt.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, Secret>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub disable_concurrent_execution: bool,
    #[serde(default, skip_serializing_if = "OnEvent::is_empty")]
    pub on_success: OnEvent,
    #[serde(default, skip_serializing_if = "OnEvent::is_empty")]
    pub on_error: OnEvent,
    #[serde(default, skip_serializing_if = "OnEvent::is_empty")]
    pub on_retries_exhausted: OnEvent,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl JobDefinition {
    /// The cron expression, treating a blank one as absent.
    pub fn cron_expr(&self) -> Option<&str> {
        self.cron.as_deref().map(str::trim).filter(|e| !e.is_empty())
    }

    /// The reactions configured for `outcome`.
    pub fn event(&self, outcome: Outcome) -> &OnEvent {
        match outcome {
            Outcome::Success => &self.on_success,
            Outcome::Error => &self.on_error,
            Outcome::RetriesExhausted => &self.on_retries_exhausted,
        }
    }

    fn events(&self) -> [&OnEvent; 3] {
        [&self.on_success, &self.on_error, &self.on_retries_exhausted]
    }
}

/// The YAML schedule file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleDocument {
    #[serde(default)]
    pub jobs: BTreeMap<String, JobDefinition>,
    #[serde(default, skip_serializing_if = "OnEvent::is_empty")]
    pub on_success: OnEvent,
    #[serde(default, skip_serializing_if = "OnEvent::is_empty")]
    pub on_error: OnEvent,
    #[serde(default, skip_serializing_if = "OnEvent::is_empty")]
    pub on_retries_exhausted: OnEvent,
    /// IANA zone name; empty or absent means host local time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz_location: Option<String>,
    /// Environment shared by every job, below each job's own `env`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, Secret>,
}

impl ScheduleDocument {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Reject cron expressions that do not parse and trigger
    /// references to jobs that do not exist.
    pub fn validate(&self) -> Result<()> {
        for (name, def) in &self.jobs {
            if let Some(expr) = def.cron_expr() {
                if let Err(e) = parse_cron(expr) {
                    return Err(SchedulerError::InvalidCron {
                        job: name.clone(),
                        expr: expr.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
            for event in def.events() {
                self.check_targets(name, event)?;
            }
        }
        for event in [&self.on_success, &self.on_error, &self.on_retries_exhausted] {
            self.check_targets("schedule", event)?;
        }
        Ok(())
    }

    fn check_targets(&self, source_name: &str, event: &OnEvent) -> Result<()> {
        match event
            .trigger_job
            .iter()
            .find(|target| !self.jobs.contains_key(target.as_str()))
        {
            Some(target) => Err(SchedulerError::UnknownTrigger {
                source_name: source_name.to_string(),
                target: target.clone(),
            }),
            None => Ok(()),
        }
    }
}
