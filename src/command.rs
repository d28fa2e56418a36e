//! Parsing and execution of bot invocations.
//!
//! An invocation is the whitespace-split message text with the leading bot
//! mention removed, e.g. `impersonate <@U123>` or `write moby dick`. Parsing
//! is table driven over [`SUBCOMMANDS`] and returns a structured
//! [`Invocation`]; execution always produces a reply string.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{debug, info};

use crate::error::CommandSyntaxError;
use crate::model::DEFAULT_MAX_ATTEMPTS;
use crate::store::{ModelStore, Namespace, EVERYONE};
use crate::text;

pub const UNKNOWN_COMMAND: &str = "Unknown command";
pub const WHO_TO_IMPERSONATE: &str = "Who should I impersonate?";

/// Slack's broadcast mention, treated the same as the word `everyone`.
const EVERYONE_MENTION: &str = "<!everyone>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelpTopic {
    Root,
    Impersonate,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Help(HelpTopic),
    Impersonate { target: Option<String> },
    Write { name: Vec<String> },
}

struct SubcommandSpec {
    name: &'static str,
    aliases: &'static [&'static str],
    topic: HelpTopic,
    arguments: &'static str,
    description: &'static str,
    argument_help: &'static str,
}

const SUBCOMMANDS: &[SubcommandSpec] = &[
    SubcommandSpec {
        name: "impersonate",
        aliases: &["do", "spoof"],
        topic: HelpTopic::Impersonate,
        arguments: "user",
        description: "Impersonate the given user",
        argument_help: "user      `me`, `everyone`, or a @mention",
    },
    SubcommandSpec {
        name: "write",
        aliases: &[],
        topic: HelpTopic::Write,
        arguments: "name [name ...]",
        description: "Write a sentence in the style of a stored text",
        argument_help: "name      name the text was added under",
    },
];

fn is_help_flag(token: &str) -> bool {
    token == "-h" || token == "--help"
}

fn find_subcommand(token: &str) -> Option<&'static SubcommandSpec> {
    SUBCOMMANDS
        .iter()
        .find(|spec| spec.name == token || spec.aliases.contains(&token))
}

/// Parse invocation tokens. A help flag anywhere after the subcommand wins
/// over argument validation.
pub fn parse<S: AsRef<str>>(tokens: &[S]) -> Result<Invocation, CommandSyntaxError> {
    let Some((first, rest)) = tokens.split_first() else {
        return Err(CommandSyntaxError::MissingSubcommand);
    };
    let first = first.as_ref();

    if is_help_flag(first) {
        return Ok(Invocation::Help(HelpTopic::Root));
    }

    let spec = find_subcommand(first)
        .ok_or_else(|| CommandSyntaxError::UnknownSubcommand(first.to_string()))?;

    if rest.iter().any(|token| is_help_flag(token.as_ref())) {
        return Ok(Invocation::Help(spec.topic));
    }

    match spec.topic {
        HelpTopic::Impersonate => Ok(Invocation::Impersonate {
            target: rest.first().map(|t| t.as_ref().to_string()),
        }),
        HelpTopic::Write if rest.is_empty() => Err(CommandSyntaxError::MissingArgument {
            command: spec.name,
            argument: "name",
        }),
        HelpTopic::Write => Ok(Invocation::Write {
            name: rest.iter().map(|t| t.as_ref().to_string()).collect(),
        }),
        HelpTopic::Root => Err(CommandSyntaxError::UnknownSubcommand(first.to_string())),
    }
}

fn mention_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^<@([^>|]+)").expect("static pattern is valid"))
}

/// Resolve an impersonation target to a chains key, or `None` when it is not
/// a recognizable participant.
pub fn resolve_target(target: &str, requester: Option<&str>) -> Option<String> {
    if target.eq_ignore_ascii_case("me") {
        return requester.map(str::to_string);
    }
    if target == EVERYONE || target == EVERYONE_MENTION {
        return Some(EVERYONE.to_string());
    }
    mention_pattern()
        .captures(target)
        .map(|caps| caps[1].to_string())
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Display name used in usage strings.
    pub bot_name: String,
    pub max_attempts: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            bot_name: "mimic".to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

pub struct CommandDispatcher {
    store: Arc<ModelStore>,
    config: DispatchConfig,
}

impl CommandDispatcher {
    pub fn new(store: Arc<ModelStore>, config: DispatchConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Run one invocation. Every outcome, including grammar errors, becomes
    /// a reply for the channel.
    pub fn dispatch<S: AsRef<str>>(&self, tokens: &[S], requester: Option<&str>) -> String {
        match parse(tokens) {
            Ok(Invocation::Help(topic)) => self.usage(topic),
            Ok(Invocation::Impersonate { target }) => self.impersonate(target.as_deref(), requester),
            Ok(Invocation::Write { name }) => self.write(&name),
            Err(e) => {
                debug!("rejected invocation: {e}");
                UNKNOWN_COMMAND.to_string()
            }
        }
    }

    fn impersonate(&self, target: Option<&str>, requester: Option<&str>) -> String {
        let Some(target) = target else {
            return WHO_TO_IMPERSONATE.to_string();
        };
        let Some(identity) = resolve_target(target, requester) else {
            return format!("I don't recognize user {target}");
        };

        let model = self.store.load(&identity, Namespace::Chains);
        match model.generate_sentence(self.config.max_attempts) {
            Some(sentence) => {
                info!(identity = %identity, "impersonating");
                sentence
            }
            None => format!("Could not impersonate <@{identity}>, not enough data"),
        }
    }

    fn write(&self, name: &[String]) -> String {
        let key = text::text_key(name);
        let model = self.store.load(&key, Namespace::Texts);
        match model.generate_sentence(self.config.max_attempts) {
            Some(sentence) => sentence,
            None => format!("I do not know how to write {}", text::detokenize(name)),
        }
    }

    pub fn usage(&self, topic: HelpTopic) -> String {
        let prog = format!("@{}", self.config.bot_name);
        match topic {
            HelpTopic::Root => {
                let choices: Vec<&str> = SUBCOMMANDS
                    .iter()
                    .flat_map(|spec| std::iter::once(spec.name).chain(spec.aliases.iter().copied()))
                    .collect();
                let choices = format!("{{{}}}", choices.join(","));

                let mut out = format!("usage: {prog} [-h] {choices} ...\n\npositional arguments:\n  {choices}\n");
                for spec in SUBCOMMANDS {
                    let mut names = spec.name.to_string();
                    if !spec.aliases.is_empty() {
                        names.push_str(&format!(" ({})", spec.aliases.join(", ")));
                    }
                    out.push_str(&format!("    {names:<26}{}\n", spec.description));
                }
                out.push_str("\noptions:\n  -h, --help                  show this help message and exit");
                out
            }
            HelpTopic::Impersonate | HelpTopic::Write => {
                let Some(spec) = SUBCOMMANDS.iter().find(|spec| spec.topic == topic) else {
                    return self.usage(HelpTopic::Root);
                };
                format!(
                    "usage: {prog} {} [-h] {}\n\n{}\n\npositional arguments:\n  {}\n\noptions:\n  -h, --help  show this help message and exit",
                    spec.name, spec.arguments, spec.description, spec.argument_help
                )
            }
        }
    }
}
