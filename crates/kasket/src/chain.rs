//! Builds and drives the per-connection filter chain.
//!
//! Chain construction flattens composites, validates each filter's
//! capability category, and precomputes per-direction dispatch tables
//! indexed by API key. Driving a request walks subscribing filters in
//! configured order; responses walk them in reverse. A short-circuited
//! response only traverses the filters that preceded the originator.

use kafka_protocol::messages::ApiKey;
use kasket_api::{
    ApiKeyHook, DecodedResponseFrame, FilterContext, FilterHooks, RequestFilter, RequestFrame,
    RequestOutcome, ResponseFilter, ResponseFrame, ResponseOutcome,
};

/// Composites may expand to composites, but only this deep.
const COMPOSITE_RECURSION_LIMIT: usize = 2;

// Dispatch tables are indexed by API key ordinal; keys above this are
// never structurally decoded, so they never reach a filter.
const API_KEY_SLOTS: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum ChainBuildError {
    #[error("filter '{0}' declares no capability")]
    NoCapability(String),
    #[error("filter '{0}' is a composite but also declares its own hooks")]
    CompositeMix(String),
    #[error("filter '{0}' mixes generic and per-API-key hooks")]
    GenericSpecificMix(String),
    #[error("filter '{0}' nests composites deeper than {COMPOSITE_RECURSION_LIMIT}")]
    CompositeTooDeep(String),
    #[error("filter '{0}' intercepts {1:?}, which this proxy does not decode")]
    NotProxied(String, ApiKey),
}

enum InstalledHooks {
    Generic {
        request: Option<Box<dyn RequestFilter>>,
        response: Option<Box<dyn ResponseFilter>>,
    },
    Specific {
        requests: Vec<(ApiKey, Box<dyn RequestFilter>)>,
        responses: Vec<(ApiKey, Box<dyn ResponseFilter>)>,
    },
}

struct Entry {
    name: String,
    hooks: InstalledHooks,
}

pub struct FilterChain {
    entries: Vec<Entry>,
    request_table: Vec<Vec<usize>>,
    response_table: Vec<Vec<usize>>,
}

impl FilterChain {
    /// Flatten and validate the configured filters, in order.
    pub fn build(filters: Vec<(String, FilterHooks)>) -> Result<FilterChain, ChainBuildError> {
        let mut entries = Vec::new();
        for (name, hooks) in filters {
            flatten(name, hooks, 0, &mut entries)?;
        }

        let mut request_table = vec![Vec::new(); API_KEY_SLOTS];
        let mut response_table = vec![Vec::new(); API_KEY_SLOTS];

        for (index, entry) in entries.iter().enumerate() {
            match &entry.hooks {
                InstalledHooks::Generic { request, response } => {
                    // Probe each proxied API key once; subscription is
                    // stable for the lifetime of a filter instance.
                    for slot in 0..API_KEY_SLOTS {
                        let Ok(api_key) = ApiKey::try_from(slot as i16) else {
                            continue;
                        };
                        if !kasket_api::is_proxied(api_key) {
                            continue;
                        }
                        if request.as_ref().map_or(false, |f| f.wants_request(api_key)) {
                            request_table[slot].push(index);
                        }
                        if response
                            .as_ref()
                            .map_or(false, |f| f.wants_response(api_key))
                        {
                            response_table[slot].push(index);
                        }
                    }
                }
                InstalledHooks::Specific {
                    requests,
                    responses,
                } => {
                    for (api_key, _) in requests {
                        request_table[*api_key as usize].push(index);
                    }
                    for (api_key, _) in responses {
                        response_table[*api_key as usize].push(index);
                    }
                }
            }
        }

        Ok(FilterChain {
            entries,
            request_table,
            response_table,
        })
    }

    /// The request API keys any installed filter subscribes to.
    pub fn request_subscriptions(&self) -> Vec<ApiKey> {
        self.request_table
            .iter()
            .enumerate()
            .filter(|(_, subscribers)| !subscribers.is_empty())
            .filter_map(|(slot, _)| ApiKey::try_from(slot as i16).ok())
            .collect()
    }

    /// The response API keys any installed filter subscribes to.
    pub fn response_subscriptions(&self) -> Vec<ApiKey> {
        self.response_table
            .iter()
            .enumerate()
            .filter(|(_, subscribers)| !subscribers.is_empty())
            .filter_map(|(slot, _)| ApiKey::try_from(slot as i16).ok())
            .collect()
    }

    pub fn wants_response(&self, api_key: ApiKey) -> bool {
        let slot = api_key as usize;
        slot < API_KEY_SLOTS && !self.response_table[slot].is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The safe invoker: the request hook of `entry` for `api_key`, or
    /// None when the filter is not interested (pure pass-through).
    fn request_hook(&mut self, entry: usize, api_key: ApiKey) -> Option<&mut dyn RequestFilter> {
        match &mut self.entries[entry].hooks {
            InstalledHooks::Generic { request, .. } => request
                .as_mut()
                .filter(|f| f.wants_request(api_key))
                .map(|f| f.as_mut()),
            InstalledHooks::Specific { requests, .. } => requests
                .iter_mut()
                .find(|(key, _)| *key == api_key)
                .map(|(_, f)| f.as_mut()),
        }
    }

    fn response_hook(&mut self, entry: usize, api_key: ApiKey) -> Option<&mut dyn ResponseFilter> {
        match &mut self.entries[entry].hooks {
            InstalledHooks::Generic { response, .. } => response
                .as_mut()
                .filter(|f| f.wants_response(api_key))
                .map(|f| f.as_mut()),
            InstalledHooks::Specific { responses, .. } => responses
                .iter_mut()
                .find(|(key, _)| *key == api_key)
                .map(|(_, f)| f.as_mut()),
        }
    }
}

fn flatten(
    name: String,
    hooks: FilterHooks,
    depth: usize,
    out: &mut Vec<Entry>,
) -> Result<(), ChainBuildError> {
    let FilterHooks {
        sub_filters,
        request,
        response,
        specific,
    } = hooks;

    let is_composite = !sub_filters.is_empty();
    let is_generic = request.is_some() || response.is_some();
    let is_specific = !specific.is_empty();

    if is_composite {
        if is_generic || is_specific {
            return Err(ChainBuildError::CompositeMix(name));
        }
        if depth >= COMPOSITE_RECURSION_LIMIT {
            return Err(ChainBuildError::CompositeTooDeep(name));
        }
        for (i, sub) in sub_filters.into_iter().enumerate() {
            flatten(format!("{name}[{i}]"), sub, depth + 1, out)?;
        }
        return Ok(());
    }

    if is_generic && is_specific {
        return Err(ChainBuildError::GenericSpecificMix(name));
    }
    if !is_generic && !is_specific {
        return Err(ChainBuildError::NoCapability(name));
    }

    let hooks = if is_generic {
        InstalledHooks::Generic { request, response }
    } else {
        let mut requests = Vec::new();
        let mut responses = Vec::new();
        for hook in specific {
            let api_key = hook.api_key();
            if !kasket_api::is_proxied(api_key) || api_key as usize >= API_KEY_SLOTS {
                return Err(ChainBuildError::NotProxied(name, api_key));
            }
            match hook {
                ApiKeyHook::Request(key, filter) => requests.push((key, filter)),
                ApiKeyHook::Response(key, filter) => responses.push((key, filter)),
            }
        }
        InstalledHooks::Specific {
            requests,
            responses,
        }
    };

    out.push(Entry { name, hooks });
    Ok(())
}

/// What the driver decided for one request frame.
pub enum RequestVerdict {
    Forward(RequestFrame),
    /// A filter answered locally; the response already traversed the
    /// preceding filters.
    Respond(ResponseFrame),
    Drop { close: bool, reason: String },
}

pub enum ResponseVerdict {
    Forward(ResponseFrame),
    Drop { close: bool, reason: String },
}

pub struct ChainDriver {
    chain: FilterChain,
    cx: FilterContext,
}

impl ChainDriver {
    pub fn new(chain: FilterChain, cx: FilterContext) -> Self {
        ChainDriver { chain, cx }
    }

    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    /// Walk a request through subscribing filters in configured order.
    pub async fn run_request(&mut self, frame: RequestFrame) -> anyhow::Result<RequestVerdict> {
        let RequestFrame::Decoded(mut frame) = frame else {
            // Nothing subscribed; relay verbatim.
            return Ok(RequestVerdict::Forward(frame));
        };

        let api_key = frame.api_key();
        let slot = api_key as usize;
        if slot >= API_KEY_SLOTS {
            return Ok(RequestVerdict::Forward(RequestFrame::Decoded(frame)));
        }

        if let Some(client_id) = &frame.header.client_id {
            self.cx.client_id = Some(client_id.clone());
        }

        let subscribers = self.chain.request_table[slot].clone();
        for entry in subscribers {
            let api_version = frame.api_version();
            let correlation_id = frame.correlation_id();

            let Some(hook) = self.chain.request_hook(entry, api_key) else {
                continue;
            };

            match hook.on_request(&mut self.cx, frame).await? {
                RequestOutcome::Forward(next) => frame = next,
                RequestOutcome::ShortCircuit(body) => {
                    metrics::counter!("kasket_frames", "direction" => "request", "outcome" => "short_circuit")
                        .increment(1);
                    let response = DecodedResponseFrame {
                        api_key,
                        api_version,
                        correlation_id,
                        body,
                    };
                    // The generated response is seen only by the
                    // filters that preceded the originator, in reverse.
                    return Ok(match self.run_response_before(response, entry).await? {
                        ResponseVerdict::Forward(frame) => RequestVerdict::Respond(frame),
                        ResponseVerdict::Drop { close, reason } => {
                            RequestVerdict::Drop { close, reason }
                        }
                    });
                }
                RequestOutcome::Fail { close, reason } => {
                    metrics::counter!("kasket_frames", "direction" => "request", "outcome" => "fail")
                        .increment(1);
                    return Ok(RequestVerdict::Drop { close, reason });
                }
            }
        }

        metrics::counter!("kasket_frames", "direction" => "request", "outcome" => "forward")
            .increment(1);
        Ok(RequestVerdict::Forward(RequestFrame::Decoded(frame)))
    }

    /// Walk a response through subscribing filters in reverse order.
    pub async fn run_response(&mut self, frame: ResponseFrame) -> anyhow::Result<ResponseVerdict> {
        let ResponseFrame::Decoded(frame) = frame else {
            return Ok(ResponseVerdict::Forward(frame));
        };
        let upto = self.chain.entries.len();
        self.run_response_before(frame, upto).await
    }

    async fn run_response_before(
        &mut self,
        mut frame: DecodedResponseFrame,
        before_entry: usize,
    ) -> anyhow::Result<ResponseVerdict> {
        let api_key = frame.api_key;
        let slot = api_key as usize;
        if slot >= API_KEY_SLOTS {
            return Ok(ResponseVerdict::Forward(ResponseFrame::Decoded(frame)));
        }

        let subscribers: Vec<usize> = self.chain.response_table[slot]
            .iter()
            .copied()
            .filter(|entry| *entry < before_entry)
            .rev()
            .collect();

        for entry in subscribers {
            let Some(hook) = self.chain.response_hook(entry, api_key) else {
                continue;
            };
            match hook.on_response(&mut self.cx, frame).await? {
                ResponseOutcome::Forward(next) => frame = next,
                ResponseOutcome::Fail { close, reason } => {
                    metrics::counter!("kasket_frames", "direction" => "response", "outcome" => "fail")
                        .increment(1);
                    return Ok(ResponseVerdict::Drop { close, reason });
                }
            }
        }

        metrics::counter!("kasket_frames", "direction" => "response", "outcome" => "forward")
            .increment(1);
        Ok(ResponseVerdict::Forward(ResponseFrame::Decoded(frame)))
    }
}
