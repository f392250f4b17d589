//! Management request/reply surface.
//!
//! Requests arrive as publishes on `mgmt.*` subjects; every reply is a
//! JSON object holding either `result` or `error {code, description}`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use plexus_storage::{HeaderMap, Message, UnixMillis};

use crate::config::{ConsumerConfig, StreamConfig, TemplateConfig, DEFAULT_PAGE_LIMIT};
use crate::error::Error;
use crate::server::Server;
use crate::snapshot::SnapshotRequest;
use crate::MGMT_PREFIX;

#[derive(Serialize)]
struct ApiError {
    code: u16,
    description: String,
}

pub(crate) fn ok_body<T: Serialize>(result: &T) -> Vec<u8> {
    serde_json::to_vec(&json!({ "result": result })).unwrap_or_else(|_| b"{}".to_vec())
}

pub(crate) fn error_body(err: &Error) -> Vec<u8> {
    let e = ApiError {
        code: err.api_code(),
        description: err.to_string(),
    };
    serde_json::to_vec(&json!({ "error": e })).unwrap_or_else(|_| b"{}".to_vec())
}

fn respond<T: Serialize>(result: Result<T, Error>) -> Option<Vec<u8>> {
    Some(match result {
        Ok(v) => ok_body(&v),
        Err(e) => error_body(&e),
    })
}

#[derive(Default, Deserialize)]
struct PageRequest {
    #[serde(default)]
    offset: usize,
}

#[derive(Serialize)]
struct PagedResponse<T> {
    total: usize,
    offset: usize,
    limit: usize,
    items: Vec<T>,
}

fn page<T>(mut items: Vec<T>, body: &[u8]) -> PagedResponse<T> {
    let req: PageRequest = if body.is_empty() {
        PageRequest::default()
    } else {
        serde_json::from_slice(body).unwrap_or_default()
    };
    let total = items.len();
    let offset = req.offset.min(total);
    let mut items: Vec<T> = items.drain(offset..).collect();
    items.truncate(DEFAULT_PAGE_LIMIT);
    PagedResponse {
        total,
        offset,
        limit: DEFAULT_PAGE_LIMIT,
        items,
    }
}

#[derive(Deserialize)]
struct MsgRequest {
    seq: u64,
}

#[derive(Serialize)]
struct StoredMsg {
    subject: String,
    seq: u64,
    headers: HeaderMap,
    data: Vec<u8>,
    time: UnixMillis,
}

impl From<Message> for StoredMsg {
    fn from(m: Message) -> Self {
        Self {
            subject: m.subject,
            seq: m.seq,
            headers: m.headers,
            data: m.payload.to_vec(),
            time: m.timestamp,
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
    Ok(serde_json::from_slice(body)?)
}

/// Dispatch one management request. `None` means no immediate response
/// (pull next requests answer through delivery).
pub(crate) async fn dispatch(
    server: &Arc<Server>,
    account: &str,
    subject: &str,
    body: &[u8],
    reply: Option<&str>,
) -> Option<Vec<u8>> {
    let Some(op) = subject.strip_prefix(MGMT_PREFIX) else {
        return None;
    };
    let tokens: Vec<&str> = op.split('.').collect();

    match tokens.as_slice() {
        ["INFO"] => respond(Ok(server.account_info(account))),

        ["STREAM", "CREATE", name] => {
            let result = async {
                let config: StreamConfig = parse(body)?;
                if config.name != *name {
                    return Err(Error::BadRequest(
                        "stream name in subject does not match request".into(),
                    ));
                }
                let stream = server.add_stream(account, config).await?;
                Ok(stream.info().await)
            }
            .await;
            respond(result)
        }

        ["STREAM", "UPDATE", name] => {
            let result = async {
                let config: StreamConfig = parse(body)?;
                if config.name != *name {
                    return Err(Error::BadRequest(
                        "stream name in subject does not match request".into(),
                    ));
                }
                let stream = server.update_stream(account, config).await?;
                Ok(stream.info().await)
            }
            .await;
            respond(result)
        }

        ["STREAM", "DELETE", name] => {
            let result = server
                .delete_stream(account, *name)
                .await
                .map(|_| json!({ "success": true }));
            respond(result)
        }

        ["STREAM", "PURGE", name] => {
            let result = async {
                let stream = server.lookup_stream(account, *name)?;
                let purged = stream.purge().await?;
                Ok(json!({ "purged": purged }))
            }
            .await;
            respond(result)
        }

        ["STREAM", "INFO", name] => {
            let result = match server.lookup_stream(account, *name) {
                Ok(stream) => Ok(stream.info().await),
                Err(e) => Err(e),
            };
            respond(result)
        }

        ["STREAM", "NAMES"] => respond(Ok(page(server.stream_names(account), body))),

        ["STREAM", "LIST"] => {
            let mut infos = Vec::new();
            for name in server.stream_names(account) {
                if let Ok(stream) = server.lookup_stream(account, &name) {
                    infos.push(stream.info().await);
                }
            }
            respond(Ok(page(infos, body)))
        }

        ["STREAM", "MSG", "GET", name] => {
            let result = async {
                let req: MsgRequest = parse(body)?;
                let stream = server.lookup_stream(account, *name)?;
                let msg = stream.get_msg(req.seq).await?;
                Ok(StoredMsg::from(msg))
            }
            .await;
            respond(result)
        }

        ["STREAM", "MSG", "DELETE", name] => {
            let result = async {
                let req: MsgRequest = parse(body)?;
                let stream = server.lookup_stream(account, *name)?;
                stream.delete_msg(req.seq).await?;
                Ok(json!({ "success": true }))
            }
            .await;
            respond(result)
        }

        ["STREAM", "SNAPSHOT", name] => {
            let result = async {
                let req: SnapshotRequest = parse(body)?;
                server.start_snapshot(account, *name, req).await
            }
            .await;
            respond(result)
        }

        ["STREAM", "RESTORE", name] => {
            let result = server
                .start_restore(account, *name)
                .map(|deliver_subject| json!({ "deliver_subject": deliver_subject }));
            respond(result)
        }

        ["CONSUMER", "CREATE", stream_name] => {
            let result = async {
                let config: ConsumerConfig = parse(body)?;
                if config.is_durable() {
                    return Err(Error::BadRequest(
                        "consumer expected to be ephemeral but a durable name was set in request"
                            .into(),
                    ));
                }
                let stream = server.lookup_stream(account, *stream_name)?;
                let consumer = stream.add_consumer(config).await?;
                Ok(consumer.info().await)
            }
            .await;
            respond(result)
        }

        ["CONSUMER", "DURABLE", "CREATE", stream_name, durable] => {
            let result = async {
                let config: ConsumerConfig = parse(body)?;
                if config.durable.as_deref() != Some(*durable) {
                    return Err(Error::BadRequest(
                        "consumer name in subject does not match durable name in request".into(),
                    ));
                }
                let stream = server.lookup_stream(account, *stream_name)?;
                let consumer = stream.add_consumer(config).await?;
                Ok(consumer.info().await)
            }
            .await;
            respond(result)
        }

        ["CONSUMER", "INFO", stream_name, consumer_name] => {
            let result = async {
                let stream = server.lookup_stream(account, *stream_name)?;
                let consumer = stream
                    .get_consumer(*consumer_name)
                    .ok_or(Error::ConsumerNotFound)?;
                Ok(consumer.info().await)
            }
            .await;
            respond(result)
        }

        ["CONSUMER", "DELETE", stream_name, consumer_name] => {
            let result = async {
                let stream = server.lookup_stream(account, *stream_name)?;
                stream.delete_consumer(*consumer_name).await?;
                Ok(json!({ "success": true }))
            }
            .await;
            respond(result)
        }

        ["CONSUMER", "NAMES", stream_name] => {
            let result = match server.lookup_stream(account, *stream_name) {
                Ok(stream) => {
                    let mut names = stream.consumer_names();
                    names.sort();
                    Ok(page(names, body))
                }
                Err(e) => Err(e),
            };
            respond(result)
        }

        ["CONSUMER", "MSG", "NEXT", stream_name, consumer_name] => {
            // Pull request: the reply inbox receives the next message(s).
            let reply = reply?;
            let result = async {
                let stream = server.lookup_stream(account, *stream_name)?;
                let consumer = stream
                    .get_consumer(*consumer_name)
                    .ok_or(Error::ConsumerNotFound)?;
                let batch = parse_batch(body)?;
                consumer.request_next(reply, batch, None).await
            }
            .await;
            match result {
                Ok(()) => None,
                Err(e) => Some(error_body(&e)),
            }
        }

        ["TEMPLATE", "CREATE", name] => {
            let result = async {
                let config: TemplateConfig = parse(body)?;
                if config.name != *name {
                    return Err(Error::BadRequest(
                        "template name in subject does not match request".into(),
                    ));
                }
                let template = server.add_template(account, config)?;
                Ok(template.info())
            }
            .await;
            respond(result)
        }

        ["TEMPLATE", "DELETE", name] => {
            let result = server
                .delete_template(account, *name)
                .await
                .map(|_| json!({ "success": true }));
            respond(result)
        }

        ["TEMPLATE", "INFO", name] => {
            let result = server
                .lookup_template(account, *name)
                .map(|t| t.info());
            respond(result)
        }

        ["TEMPLATE", "NAMES"] => respond(Ok(page(server.template_names(account), body))),

        _ => respond::<serde_json::Value>(Err(Error::BadRequest(format!(
            "unknown management request: {subject}"
        )))),
    }
}

/// Pull request body: empty means one message, otherwise a decimal batch.
fn parse_batch(body: &[u8]) -> Result<usize, Error> {
    let text = std::str::from_utf8(body)
        .map_err(|_| Error::BadRequest("batch size is not a number".into()))?
        .trim();
    if text.is_empty() {
        return Ok(1);
    }
    text.parse::<usize>()
        .map_err(|_| Error::BadRequest("batch size is not a number".into()))
        .map(|b| b.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_parsing() {
        assert_eq!(parse_batch(b"").unwrap(), 1);
        assert_eq!(parse_batch(b"10").unwrap(), 10);
        assert_eq!(parse_batch(b" 5 ").unwrap(), 5);
        assert!(parse_batch(b"abc").is_err());
    }

    #[test]
    fn paging_clamps_offset() {
        let items: Vec<u32> = (0..300).collect();
        let p = page(items, b"{\"offset\": 290}");
        assert_eq!(p.total, 300);
        assert_eq!(p.offset, 290);
        assert_eq!(p.items.len(), 10);

        let p = page((0..300).collect::<Vec<u32>>(), b"");
        assert_eq!(p.items.len(), DEFAULT_PAGE_LIMIT);
        assert_eq!(p.items[0], 0);
    }

    #[test]
    fn error_body_shape() {
        let body = error_body(&Error::StreamNotFound);
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["error"]["code"], 404);
        assert_eq!(v["error"]["description"], "stream not found");
    }
}
