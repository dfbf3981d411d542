//! Elasticsearch client over HTTP.
//!
//! Each [`UpsertRequest`] becomes one call to the `_update` API with a Painless
//! script and an `upsert` fallback document:
//!
//! ```text
//! POST {server}/{index}/_update/{key}            (typeless)
//! POST {server}/{index}/{type}/{key}/_update     (legacy mapping types)
//!
//! {"script": {"lang": "painless", "source": "...", "params": {...}}, "upsert": {...}}
//! ```

use async_trait::async_trait;
use reqwest::Url;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{IndexClient, UpsertRequest, WriteOutcome};
use crate::config::ElasticsearchSettings;
use crate::error::{IndexError, PipelineError};
use crate::merge::{MergeOp, MergeScript};

/// Shared HTTP client plus the connection settings it needs.
#[derive(Debug, Clone)]
pub struct ElasticsearchClient {
    base: Url,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
}

impl ElasticsearchClient {
    pub fn new(settings: &ElasticsearchSettings) -> Result<Self, PipelineError> {
        let uri = settings.base_uri();
        let base = Url::parse(&uri)
            .map_err(|e| PipelineError::Config(format!("invalid Elasticsearch server {}: {}", uri, e)))?;
        if base.cannot_be_a_base() {
            return Err(PipelineError::Config(format!(
                "invalid Elasticsearch server {}: not a base URL",
                uri
            )));
        }
        Ok(ElasticsearchClient {
            base,
            username: settings.username.clone(),
            password: settings.password.clone(),
            client: reqwest::Client::new(),
        })
    }

    /// URL of the `_update` endpoint for the request's document.
    pub fn update_url(&self, request: &UpsertRequest) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            segments.push(&request.index);
            match &request.doc_type {
                Some(doc_type) => {
                    segments.extend([doc_type.as_str(), request.key.as_str(), "_update"]);
                }
                None => {
                    segments.extend(["_update", request.key.as_str()]);
                }
            }
        }
        url
    }

    /// JSON body sent to the `_update` endpoint.
    pub fn update_body(request: &UpsertRequest) -> Value {
        json!({
            "script": {
                "lang": "painless",
                "source": render_painless(&request.script),
                "params": request.params,
            },
            "upsert": request.upsert,
        })
    }
}

/// Reads the outcome from an `_update` response body.
///
/// Current servers report `"result": "created" | "updated" | "noop"`; older
/// ones only carry a boolean `created`.
pub fn parse_update_response(body: &Value) -> Result<WriteOutcome, IndexError> {
    if let Some(result) = body.get("result").and_then(Value::as_str) {
        return match result {
            "created" => Ok(WriteOutcome::Created),
            "updated" => Ok(WriteOutcome::Updated),
            "noop" => Ok(WriteOutcome::Noop),
            other => Err(IndexError::UnexpectedResponse(format!(
                "unknown update result `{}`",
                other
            ))),
        };
    }
    match body.get("created").and_then(Value::as_bool) {
        Some(true) => Ok(WriteOutcome::Created),
        Some(false) => Ok(WriteOutcome::Updated),
        None => Err(IndexError::UnexpectedResponse(format!(
            "update response carries no result: {}",
            body
        ))),
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn source_field(field: &str) -> String {
    format!("ctx._source[{}]", quote(field))
}

fn param_ref(name: &str) -> String {
    format!("params[{}]", quote(name))
}

fn ensure_array(field: &str) -> String {
    let target = source_field(field);
    format!("if ({target} == null) {{ {target} = []; }}")
}

/// Translates merge ops into a Painless script with the same semantics.
///
/// Every op raises `changed` only when it actually alters the document, and a
/// script that changed nothing sets `ctx.op = 'noop'`, so the server reports
/// `noop` exactly when [`MergeScript::apply_to`] would leave the document equal.
pub fn render_painless(script: &MergeScript) -> String {
    let mut lines = Vec::with_capacity(script.ops().len() + 2);
    lines.push("boolean changed = false;".to_string());
    for (n, op) in script.ops().iter().enumerate() {
        let line = match op {
            MergeOp::SetFields { param } => format!(
                "for (entry in {}.entrySet()) {{ \
                 if (!ctx._source.containsKey(entry.getKey()) || \
                 !Objects.equals(ctx._source[entry.getKey()], entry.getValue())) {{ \
                 ctx._source[entry.getKey()] = entry.getValue(); changed = true; }} }}",
                param_ref(param)
            ),
            MergeOp::Append { field, param } => format!(
                "{} {}.add({}); changed = true;",
                ensure_array(field),
                source_field(field),
                param_ref(param)
            ),
            MergeOp::AppendUnlessPresent { field, param, key } => {
                let found = format!("found{}", n);
                format!(
                    "{ensure} boolean {found} = false; \
                     for (def item : {target}) {{ if (item[{key}] == {value}[{key}]) {{ {found} = true; break; }} }} \
                     if (!{found}) {{ {target}.add({value}); changed = true; }}",
                    ensure = ensure_array(field),
                    target = source_field(field),
                    key = quote(key),
                    value = param_ref(param),
                    found = found,
                )
            }
            MergeOp::SetWhereMatch {
                field,
                key,
                match_param,
                set,
                value_param,
            } => format!(
                "if ({target} != null) {{ for (def item : {target}) {{ \
                 if (item[{key}] == {wanted}) {{ \
                 if (!item.containsKey({set}) || !Objects.equals(item[{set}], {value})) {{ \
                 item[{set}] = {value}; changed = true; }} break; }} }} }}",
                target = source_field(field),
                key = quote(key),
                wanted = param_ref(match_param),
                set = quote(set),
                value = param_ref(value_param),
            ),
        };
        lines.push(line);
    }
    lines.push("if (!changed) { ctx.op = 'noop'; }".to_string());
    lines.join("\n")
}

#[async_trait]
impl IndexClient for ElasticsearchClient {
    async fn upsert_with_patch(&self, request: &UpsertRequest) -> Result<WriteOutcome, IndexError> {
        let url = self.update_url(request);
        let body = Self::update_body(request);

        let mut builder = self.client.post(url.clone()).json(&body);
        if let Some(username) = &self.username {
            builder = builder.basic_auth(username, self.password.as_ref());
        }

        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body_text = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            warn!(
                url = %url,
                %status,
                body = %body_text,
                "Elasticsearch update returned non-2xx status"
            );
            return Err(IndexError::Status {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let response_body: Value = response.json().await?;
        let outcome = parse_update_response(&response_body)?;
        debug!(url = %url, ?outcome, "Elasticsearch update applied");
        Ok(outcome)
    }

    fn backend_name(&self) -> &str {
        "elasticsearch"
    }
}
