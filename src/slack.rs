//! Slack Web API transport.
//!
//! Polls `conversations.history` for the channels the bot is a member of,
//! a few channels per poll in rotation, keeping a per-channel `oldest` cursor
//! so each message is delivered once. A channel's cursor only moves when its
//! messages are part of the returned batch. Replies go out through
//! `chat.postMessage`.
//!
//! Rate limiting (HTTP 429 or an `ok:false` `ratelimited` envelope) pauses
//! polling for the `Retry-After` period.

use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::{BotIdentity, InboundMessage, Transport};

pub const DEFAULT_API_BASE: &str = "https://slack.com/api";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const HISTORY_PAGE_LIMIT: &str = "200";
/// Re-list joined channels after this many polls to pick up new ones.
const CHANNEL_REFRESH_POLLS: u32 = 240;
/// Pause used when a rate-limited response carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);
const RATE_LIMITED_ERROR: &str = "ratelimited";

/// Subtypes that are channel events or edits rather than something a person
/// said. Other subtypes (`thread_broadcast`, `file_share`, `me_message`, ...)
/// are delivered as ordinary messages.
const NON_CONVERSATION_SUBTYPES: &[&str] = &[
    "bot_message",
    "message_changed",
    "message_deleted",
    "message_replied",
    "channel_join",
    "channel_leave",
    "channel_topic",
    "channel_purpose",
    "channel_name",
    "channel_archive",
    "channel_unarchive",
    "group_join",
    "group_leave",
    "group_topic",
    "group_purpose",
    "group_name",
    "group_archive",
    "group_unarchive",
    "pinned_item",
    "unpinned_item",
];

#[derive(Deserialize)]
struct AuthTest {
    user_id: String,
    user: String,
}

#[derive(Deserialize)]
struct ChannelList {
    channels: Vec<Channel>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Deserialize)]
struct Channel {
    id: String,
    #[serde(default)]
    is_member: bool,
}

#[derive(Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: String,
}

#[derive(Deserialize)]
struct History {
    messages: Vec<HistoryMessage>,
}

#[derive(Deserialize)]
struct HistoryMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    user: Option<String>,
    ts: String,
}

pub struct SlackTransport {
    client: Client,
    token: String,
    api_base: String,
    identity: Option<BotIdentity>,
    /// channel id -> timestamp of the newest message already delivered
    cursors: BTreeMap<String, String>,
    /// Rotation offset into `cursors` for the next poll.
    next_channel: usize,
    channels_per_poll: usize,
    polls_since_refresh: u32,
    throttled_until: Option<Instant>,
}

/// Result of fetching history for one round of channels.
struct Round {
    batch: Vec<InboundMessage>,
    /// `(channel, newest ts)` for channels whose messages are in `batch`.
    advanced: Vec<(String, String)>,
    fetched: usize,
    error: Option<TransportError>,
}

impl SlackTransport {
    pub fn new(token: &str, api_base: &str, channels_per_poll: usize) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| TransportError::Http {
                method: "client".to_string(),
                source,
            })?;
        Ok(Self {
            client,
            token: token.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            identity: None,
            cursors: BTreeMap::new(),
            next_channel: 0,
            channels_per_poll: channels_per_poll.max(1),
            polls_since_refresh: 0,
            throttled_until: None,
        })
    }

    fn get<T: DeserializeOwned>(&self, method: &str, query: &[(&str, &str)]) -> Result<T, TransportError> {
        let request = self.client.get(format!("{}/{method}", self.api_base)).query(query);
        self.call(method, request)
    }

    fn post<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T, TransportError> {
        let request = self.client.post(format!("{}/{method}", self.api_base)).json(body);
        self.call(method, request)
    }

    fn call<T: DeserializeOwned>(&self, method: &str, request: RequestBuilder) -> Result<T, TransportError> {
        let http_error = |source| TransportError::Http {
            method: method.to_string(),
            source,
        };
        let response = request.bearer_auth(&self.token).send().map_err(http_error)?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::RateLimited {
                method: method.to_string(),
                retry_after: retry_after(response.headers()),
            });
        }
        let body = response
            .error_for_status()
            .and_then(|r| r.json::<Value>())
            .map_err(http_error)?;
        unwrap_envelope(method, body)
    }

    fn joined_channels(&self) -> Result<Vec<String>, TransportError> {
        let mut joined = Vec::new();
        let mut cursor = String::new();
        loop {
            let mut query = vec![
                ("types", "public_channel,private_channel"),
                ("exclude_archived", "true"),
                ("limit", "200"),
            ];
            if !cursor.is_empty() {
                query.push(("cursor", cursor.as_str()));
            }
            let page: ChannelList = self.get("conversations.list", &query)?;
            joined.extend(page.channels.into_iter().filter(|c| c.is_member).map(|c| c.id));

            match page.response_metadata {
                Some(meta) if !meta.next_cursor.is_empty() => cursor = meta.next_cursor,
                _ => break,
            }
        }
        Ok(joined)
    }

    /// Track newly joined channels from now on; channels we left are dropped.
    fn refresh_channels(&mut self) -> Result<(), TransportError> {
        let joined = self.joined_channels()?;
        let now = slack_ts_now();
        self.cursors.retain(|channel, _| joined.contains(channel));
        for channel in joined {
            self.cursors.entry(channel).or_insert_with(|| now.clone());
        }
        self.polls_since_refresh = 0;
        self.next_channel = 0;
        debug!(channels = self.cursors.len(), "channel list refreshed");
        Ok(())
    }

    fn poll_channel(&self, channel: &str, oldest: &str) -> Result<Vec<HistoryMessage>, TransportError> {
        let history: History = self.get(
            "conversations.history",
            &[("channel", channel), ("oldest", oldest), ("limit", HISTORY_PAGE_LIMIT)],
        )?;
        Ok(history.messages)
    }

    /// The next `channels_per_poll` channels in rotation, with their cursors.
    fn due_channels(&mut self) -> Vec<(String, String)> {
        let due = rotation(&self.cursors, self.next_channel, self.channels_per_poll);
        if !self.cursors.is_empty() {
            self.next_channel = (self.next_channel + due.len()) % self.cursors.len();
        }
        due
    }

    fn is_throttled(&mut self, now: Instant) -> bool {
        match self.throttled_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.throttled_until = None;
                false
            }
            None => false,
        }
    }

    fn throttle(&mut self, method: &str, retry_after: Duration) {
        warn!(method, ?retry_after, "rate limited by slack, pausing polls");
        self.throttled_until = Some(Instant::now() + retry_after);
    }
}

impl Transport for SlackTransport {
    fn connect(&mut self) -> Result<BotIdentity, TransportError> {
        let auth: AuthTest = self.post("auth.test", &json!({}))?;
        let identity = BotIdentity {
            id: auth.user_id,
            name: auth.user,
        };
        info!(id = %identity.id, name = %identity.name, "connected to slack");
        self.identity = Some(identity.clone());
        self.refresh_channels()?;
        Ok(identity)
    }

    fn poll(&mut self) -> Result<Vec<InboundMessage>, TransportError> {
        if self.identity.is_none() {
            return Err(TransportError::NotConnected);
        }
        if self.is_throttled(Instant::now()) {
            return Ok(Vec::new());
        }
        self.polls_since_refresh += 1;
        if self.polls_since_refresh >= CHANNEL_REFRESH_POLLS {
            if let Err(e) = self.refresh_channels() {
                if let TransportError::RateLimited { ref method, retry_after } = e {
                    self.throttle(method, retry_after);
                }
                return Err(e);
            }
        }

        let due = self.due_channels();
        let round = fetch_round(due, |channel, oldest| self.poll_channel(channel, oldest));
        for (channel, newest) in round.advanced {
            self.cursors.insert(channel, newest);
        }

        match round.error {
            Some(TransportError::RateLimited { ref method, retry_after }) => {
                self.throttle(method, retry_after);
            }
            Some(e) if round.fetched == 0 => return Err(e),
            _ => {}
        }
        Ok(round.batch)
    }

    fn send(&mut self, channel_id: &str, text: &str) -> Result<(), TransportError> {
        if self.identity.is_none() {
            return Err(TransportError::NotConnected);
        }
        let _: Value = self.post("chat.postMessage", &json!({ "channel": channel_id, "text": text }))?;
        Ok(())
    }
}

fn unwrap_envelope<T: DeserializeOwned>(method: &str, response: Value) -> Result<T, TransportError> {
    if response.get("ok").and_then(Value::as_bool) != Some(true) {
        let error = response
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error")
            .to_string();
        if error == RATE_LIMITED_ERROR {
            return Err(TransportError::RateLimited {
                method: method.to_string(),
                retry_after: DEFAULT_RETRY_AFTER,
            });
        }
        return Err(TransportError::Api {
            method: method.to_string(),
            error,
        });
    }
    serde_json::from_value(response).map_err(|e| TransportError::Api {
        method: method.to_string(),
        error: format!("unexpected response shape: {e}"),
    })
}

fn retry_after(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// Up to `count` channels starting at `start`, wrapping around.
fn rotation(cursors: &BTreeMap<String, String>, start: usize, count: usize) -> Vec<(String, String)> {
    if cursors.is_empty() {
        return Vec::new();
    }
    cursors
        .iter()
        .cycle()
        .skip(start % cursors.len())
        .take(count.min(cursors.len()))
        .map(|(channel, oldest)| (channel.clone(), oldest.clone()))
        .collect()
}

/// Fetch each due channel in turn. A failing channel keeps its cursor and is
/// retried on a later poll; messages already fetched from other channels are
/// still returned. A rate limit ends the round early.
fn fetch_round<F>(due: Vec<(String, String)>, mut fetch: F) -> Round
where
    F: FnMut(&str, &str) -> Result<Vec<HistoryMessage>, TransportError>,
{
    let mut round = Round {
        batch: Vec::new(),
        advanced: Vec::new(),
        fetched: 0,
        error: None,
    };
    for (channel, oldest) in due {
        match fetch(&channel, &oldest) {
            Ok(messages) => {
                round.fetched += 1;
                if let Some(newest) = messages.first() {
                    round.advanced.push((channel.clone(), newest.ts.clone()));
                }
                round.batch.extend(into_inbound(&channel, messages));
            }
            Err(e @ TransportError::RateLimited { .. }) => {
                round.error = Some(e);
                break;
            }
            Err(e) => {
                warn!(channel = %channel, "history fetch failed: {e}");
                round.error = Some(e);
            }
        }
    }
    round
}

/// History arrives newest first; events are delivered oldest first. Messages
/// whose subtype is a channel event, edit or bot post keep the subtype as
/// their kind.
fn into_inbound(channel: &str, messages: Vec<HistoryMessage>) -> Vec<InboundMessage> {
    messages
        .into_iter()
        .rev()
        .map(|m| InboundMessage {
            kind: match m.subtype {
                Some(subtype) if NON_CONVERSATION_SUBTYPES.contains(&subtype.as_str()) => subtype,
                _ => m.kind,
            },
            text: m.text,
            author_id: m.user,
            channel_id: channel.to_string(),
        })
        .collect()
}

fn slack_ts_now() -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{}.{:06}", now.as_secs(), now.subsec_micros())
}
