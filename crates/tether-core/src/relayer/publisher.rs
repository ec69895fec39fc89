//! Publish jobs: one relay `*_publish` RPC per attempt, bounded by a timeout.
//!
//! Failed or timed-out jobs wait in a retry queue drained on each pulse.
//! The publisher never touches the socket; it returns [`PublisherAction`]s.
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tether_transport::{relay_rpc_id, JsonRpcRequest, PublishParams, RelayMethods};

use crate::rpc::MethodOpts;
use crate::types::{RelayProtocolOptions, Topic, SIX_HOURS};

/// Options attached to a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOpts {
    pub ttl: u64,
    pub tag: u32,
    pub prompt: Option<bool>,
    pub relay: RelayProtocolOptions,
    /// Reuse a relay request id instead of generating one.
    pub id: Option<u64>,
    /// Fail the caller instead of queueing for retry.
    pub hard_fail: bool,
}

impl Default for PublishOpts {
    fn default() -> Self {
        Self {
            ttl: SIX_HOURS,
            tag: 0,
            prompt: None,
            relay: RelayProtocolOptions::default(),
            id: None,
            hard_fail: false,
        }
    }
}

impl From<MethodOpts> for PublishOpts {
    fn from(opts: MethodOpts) -> Self {
        Self {
            ttl: opts.ttl,
            tag: opts.tag,
            prompt: opts.prompt.then_some(true),
            ..Self::default()
        }
    }
}

/// When the retry queue gives up on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Defaults to the job's own ttl when unset.
    pub max_age: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            max_age: None,
        }
    }
}

impl RetryPolicy {
    fn exhausted(&self, job: &PublishJob, now: u64) -> bool {
        let max_age_ms = self
            .max_age
            .map(|d| d.as_millis() as u64)
            .unwrap_or(job.opts.ttl * 1000);
        job.attempts >= self.max_attempts || now.saturating_sub(job.first_attempt) > max_age_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishJob {
    pub id: u64,
    pub topic: Topic,
    pub message: String,
    pub opts: PublishOpts,
    pub attempts: u32,
    /// Unix ms of the first attempt.
    pub first_attempt: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublisherAction {
    /// Write a frame to the relay.
    Send(String),
    ArmTimeout { id: u64, after: Duration },
    DisarmTimeout(u64),
    /// The relay acknowledged the job.
    Published { id: u64, topic: Topic },
    /// A hard-fail job failed; no retry will follow.
    Failed { id: u64, reason: String },
    /// A timeout was seen since the last pulse.
    Stalled,
    /// The retry policy gave up.
    Abandoned { id: u64, topic: Topic, attempts: u32 },
}

pub struct Publisher {
    methods: RelayMethods,
    timeout: Duration,
    retry: RetryPolicy,
    in_flight: HashMap<u64, PublishJob>,
    queue: BTreeMap<u64, PublishJob>,
    needs_transport_restart: bool,
}

impl Publisher {
    pub fn new(methods: RelayMethods, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            methods,
            timeout,
            retry,
            in_flight: HashMap::new(),
            queue: BTreeMap::new(),
            needs_transport_restart: false,
        }
    }

    /// Start a job. Returns its relay request id.
    pub fn publish(
        &mut self,
        topic: &str,
        message: &str,
        opts: PublishOpts,
        connected: bool,
        now: u64,
    ) -> (u64, Vec<PublisherAction>) {
        let id = opts.id.unwrap_or_else(relay_rpc_id);
        let job = PublishJob {
            id,
            topic: topic.to_string(),
            message: message.to_string(),
            opts,
            attempts: 0,
            first_attempt: now,
        };

        let mut actions = Vec::new();
        if connected {
            self.attempt(job, &mut actions);
        } else {
            tracing::debug!(id, %topic, "relay offline, publish queued");
            if job.opts.hard_fail {
                // Bounded by the same timeout as a sent attempt.
                actions.push(PublisherAction::ArmTimeout {
                    id,
                    after: self.timeout,
                });
            }
            self.queue.insert(id, job);
        }
        (id, actions)
    }

    fn attempt(&mut self, mut job: PublishJob, actions: &mut Vec<PublisherAction>) {
        job.attempts += 1;
        let params = PublishParams {
            topic: job.topic.clone(),
            message: job.message.clone(),
            ttl: job.opts.ttl,
            tag: job.opts.tag,
            prompt: job.opts.prompt,
        };
        let frame = serde_json::to_value(params)
            .map(|params| JsonRpcRequest::with_id(job.id, self.methods.publish.clone(), params))
            .ok()
            .and_then(|req| req.to_json().ok());
        let Some(frame) = frame else {
            tracing::error!(id = job.id, "failed to serialize publish request");
            return;
        };

        actions.push(PublisherAction::Send(frame));
        actions.push(PublisherAction::ArmTimeout {
            id: job.id,
            after: self.timeout,
        });
        self.in_flight.insert(job.id, job);
    }

    pub fn owns(&self, id: u64) -> bool {
        self.in_flight.contains_key(&id) || self.queue.contains_key(&id)
    }

    /// Relay acknowledgement (or error) for a publish RPC.
    pub fn on_ack(&mut self, id: u64, error: Option<String>) -> Vec<PublisherAction> {
        let job = self.in_flight.remove(&id).or_else(|| self.queue.remove(&id));
        let Some(job) = job else {
            return Vec::new();
        };

        let mut actions = vec![PublisherAction::DisarmTimeout(id)];
        match error {
            None => actions.push(PublisherAction::Published {
                id,
                topic: job.topic,
            }),
            Some(reason) => {
                tracing::warn!(id, %reason, "relay rejected publish");
                self.fail_or_requeue(job, reason, &mut actions);
            }
        }
        actions
    }

    /// The publish timer for `id` fired.
    pub fn on_timeout(&mut self, id: u64) -> Vec<PublisherAction> {
        let mut actions = Vec::new();
        if let Some(job) = self.in_flight.remove(&id) {
            tracing::warn!(id, topic = %job.topic, attempts = job.attempts, "publish timed out");
            self.needs_transport_restart = true;
            self.fail_or_requeue(job, "publish timed out".into(), &mut actions);
        } else if self.queue.get(&id).is_some_and(|job| job.opts.hard_fail) {
            if let Some(job) = self.queue.remove(&id) {
                actions.push(PublisherAction::Failed {
                    id: job.id,
                    reason: "relay unavailable".into(),
                });
            }
        }
        actions
    }

    fn fail_or_requeue(
        &mut self,
        job: PublishJob,
        reason: String,
        actions: &mut Vec<PublisherAction>,
    ) {
        if job.opts.hard_fail {
            actions.push(PublisherAction::Failed { id: job.id, reason });
        } else {
            self.queue.insert(job.id, job);
        }
    }

    /// Heartbeat pulse: report a stall, or drain the retry queue.
    pub fn on_pulse(&mut self, connected: bool, now: u64) -> Vec<PublisherAction> {
        if self.needs_transport_restart {
            self.needs_transport_restart = false;
            return vec![PublisherAction::Stalled];
        }
        if !connected {
            return Vec::new();
        }
        self.drain(now)
    }

    /// Re-attempt every queued job.
    pub fn drain(&mut self, now: u64) -> Vec<PublisherAction> {
        let mut actions = Vec::new();
        let ids: Vec<u64> = self.queue.keys().copied().collect();
        for id in ids {
            // An ack may have removed it meanwhile.
            let Some(job) = self.queue.remove(&id) else {
                continue;
            };
            if job.opts.hard_fail {
                actions.push(PublisherAction::DisarmTimeout(id));
                self.attempt(job, &mut actions);
                continue;
            }
            if self.retry.exhausted(&job, now) {
                tracing::warn!(
                    id,
                    topic = %job.topic,
                    attempts = job.attempts,
                    "publish abandoned by retry policy"
                );
                actions.push(PublisherAction::Abandoned {
                    id,
                    topic: job.topic,
                    attempts: job.attempts,
                });
                continue;
            }
            self.attempt(job, &mut actions);
        }
        actions
    }

    /// The socket went away: in-flight jobs go back to the queue.
    pub fn on_disconnected(&mut self) -> Vec<PublisherAction> {
        let mut actions = Vec::new();
        let jobs: Vec<PublishJob> = self.in_flight.drain().map(|(_, job)| job).collect();
        for job in jobs {
            actions.push(PublisherAction::DisarmTimeout(job.id));
            self.fail_or_requeue(job, "relay disconnected".into(), &mut actions);
        }
        actions
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
