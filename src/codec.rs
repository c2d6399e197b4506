//! Frame codec: the length-validated, line-framed wire protocol.
//!
//! Wire form (one message per line): `TYPE|USER_ID|FILE_ID|DATA|TIMESTAMP\n`.
//! `DATA` is `empty` or a comma-separated `k:v` list; control characters in
//! `text` values are transmitted via reserved escape markers
//! (`__SPACE__`/`__TAB__`/`__NEWLINE__`/`__CRLF__`) since the field
//! separator, pair separator, and line terminator all collide with raw text.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::EngineError;
use crate::{FileId, UserId};

pub const FIELD_SEP: char = '|';
pub const PAIR_SEP: char = ',';
pub const KV_SEP: char = ':';
const NULL_TOKEN: &str = "null";
const EMPTY_DATA: &str = "empty";

/// A raw, decoded line: five pipe-delimited fields, with `data` parsed into
/// its key/value pairs. This is the level at which escape markers are
/// resolved; [`Message`] is the typed layer built on top of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: String,
    pub user_id: Option<String>,
    pub file_id: Option<String>,
    pub data: BTreeMap<String, String>,
    pub timestamp: u64,
}

impl Frame {
    pub fn parse(line: &str, max_frame_size: usize) -> Result<Self, EngineError> {
        if line.is_empty() {
            return Err(EngineError::MalformedFrame {
                reason: "empty line".into(),
            });
        }
        if line.len() > max_frame_size {
            return Err(EngineError::MalformedFrame {
                reason: format!("frame of {} bytes exceeds maximum {max_frame_size}", line.len()),
            });
        }

        let fields: Vec<&str> = line.splitn(5, FIELD_SEP).collect();
        if fields.len() != 5 {
            return Err(EngineError::MalformedFrame {
                reason: format!("expected 5 fields, got {}", fields.len()),
            });
        }
        let [kind, user_id, file_id, data, timestamp] = [fields[0], fields[1], fields[2], fields[3], fields[4]];

        if kind.is_empty() {
            return Err(EngineError::MalformedFrame {
                reason: "empty TYPE".into(),
            });
        }

        let data = parse_data(data)?;
        let timestamp: u64 = timestamp.parse().map_err(|_| EngineError::MalformedFrame {
            reason: format!("TIMESTAMP {timestamp:?} is not a valid unsigned integer"),
        })?;

        Ok(Frame {
            kind: kind.to_string(),
            user_id: token_to_option(user_id),
            file_id: token_to_option(file_id),
            data,
            timestamp,
        })
    }

    pub fn encode(&self) -> String {
        let data = if self.data.is_empty() {
            EMPTY_DATA.to_string()
        } else {
            self.data
                .iter()
                .map(|(k, v)| format!("{k}{KV_SEP}{v}"))
                .collect::<Vec<_>>()
                .join(&PAIR_SEP.to_string())
        };
        format!(
            "{}{FIELD_SEP}{}{FIELD_SEP}{}{FIELD_SEP}{data}{FIELD_SEP}{}",
            self.kind,
            option_to_token(&self.user_id),
            option_to_token(&self.file_id),
            self.timestamp,
        )
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn get_required(&self, key: &str) -> Result<&str, EngineError> {
        self.get(key).ok_or_else(|| EngineError::InvalidArguments {
            field: key.to_string(),
        })
    }

    pub fn get_u32(&self, key: &str) -> Result<u32, EngineError> {
        self.get_required(key)?
            .parse()
            .map_err(|_| EngineError::InvalidArguments {
                field: key.to_string(),
            })
    }
}

fn token_to_option(token: &str) -> Option<String> {
    if token == NULL_TOKEN {
        None
    } else {
        Some(token.to_string())
    }
}

fn option_to_token(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| NULL_TOKEN.to_string())
}

fn parse_data(raw: &str) -> Result<BTreeMap<String, String>, EngineError> {
    if raw == EMPTY_DATA || raw.is_empty() {
        return Ok(BTreeMap::new());
    }
    let mut data = BTreeMap::new();
    for pair in raw.split(PAIR_SEP) {
        let mut parts = pair.splitn(2, KV_SEP);
        let key = parts.next().unwrap_or("").trim();
        let value = parts
            .next()
            .ok_or_else(|| EngineError::MalformedFrame {
                reason: format!("malformed key:value pair {pair:?}"),
            })?
            .trim();
        if key.is_empty() {
            return Err(EngineError::MalformedFrame {
                reason: "empty key in DATA".into(),
            });
        }
        data.insert(key.to_string(), decode_escapes(value));
    }
    Ok(data)
}

/// Replaces reserved escape markers with their literal control character.
pub fn decode_escapes(value: &str) -> String {
    value
        .replace("__CRLF__", "\r\n")
        .replace("__NEWLINE__", "\n")
        .replace("__TAB__", "\t")
        .replace("__SPACE__", " ")
}

/// Replaces control characters with their reserved escape marker. Order
/// matters: CRLF must be escaped before lone `\n`/`\r` would otherwise be.
pub fn encode_escapes(value: &str) -> String {
    value
        .replace("\r\n", "__CRLF__")
        .replace('\n', "__NEWLINE__")
        .replace('\t', "__TAB__")
        .replace(' ', "__SPACE__")
}

/// Status carried by `*_ACK` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Fail,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Success => "success",
            Status::Fail => "fail",
        })
    }
}

/// The kind of edit carried by a TEXT_UPDATE broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Insert,
    Delete,
}

/// The typed message layer. Every variant round-trips through [`Frame`]
/// losslessly for the fields the specification requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Connect,
    ConnectAck { status: Status, message: String },
    Disconnect,
    Register { username: String, password: String },
    RegisterAck { status: Status, message: String },
    Login { username: String, password: String },
    LoginAck { status: Status, message: String },
    FileList,
    FileListResp { files: Vec<(FileId, String, usize)> },
    FileCreate { name: String },
    FileOpen { file_id: FileId },
    FileContent { file_id: FileId, content: String, users: Vec<UserId>, name: Option<String> },
    FileDelete { file_id: FileId },
    FileDeleteAck { status: Status, message: String },
    TextInsert { file_id: FileId, position: u32, text: String },
    TextDelete { file_id: FileId, position: u32, length: u32 },
    TextUpdate { file_id: FileId, kind: UpdateKind, position: u32, text: Option<String>, length: Option<u32> },
    Save { file_id: FileId },
    SaveAck { status: Status, message: String },
    Error { message: String },
}

impl Message {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Connect => "CONNECT",
            Message::ConnectAck { .. } => "CONNECT_ACK",
            Message::Disconnect => "DISCONNECT",
            Message::Register { .. } => "REGISTER",
            Message::RegisterAck { .. } => "REGISTER_ACK",
            Message::Login { .. } => "LOGIN",
            Message::LoginAck { .. } => "LOGIN_ACK",
            Message::FileList => "FILE_LIST",
            Message::FileListResp { .. } => "FILE_LIST_RESP",
            Message::FileCreate { .. } => "FILE_CREATE",
            Message::FileOpen { .. } => "FILE_OPEN",
            Message::FileContent { .. } => "FILE_CONTENT",
            Message::FileDelete { .. } => "FILE_DELETE",
            Message::FileDeleteAck { .. } => "FILE_DELETE_ACK",
            Message::TextInsert { .. } => "TEXT_INSERT",
            Message::TextDelete { .. } => "TEXT_DELETE",
            Message::TextUpdate { .. } => "TEXT_UPDATE",
            Message::Save { .. } => "SAVE",
            Message::SaveAck { .. } => "SAVE",
            Message::Error { .. } => "ERROR",
        }
    }
}

#[derive(Clone)]
pub struct Codec {
    pub max_frame_size: usize,
    pub max_insert_len: usize,
}

impl Codec {
    pub fn new(max_frame_size: usize, max_insert_len: usize) -> Self {
        Self {
            max_frame_size,
            max_insert_len,
        }
    }

    pub fn decode(&self, line: &str) -> Result<Message, EngineError> {
        let frame = Frame::parse(line, self.max_frame_size)?;
        self.frame_to_message(frame)
    }

    pub fn encode(&self, user_id: Option<UserId>, message: &Message) -> String {
        self.message_to_frame(user_id, message).encode()
    }

    fn frame_to_message(&self, frame: Frame) -> Result<Message, EngineError> {
        match frame.kind.as_str() {
            "CONNECT" => Ok(Message::Connect),
            "DISCONNECT" => Ok(Message::Disconnect),
            "REGISTER" => Ok(Message::Register {
                username: frame.get_required("username")?.to_string(),
                password: frame.get_required("password")?.to_string(),
            }),
            "LOGIN" => Ok(Message::Login {
                username: frame.get_required("username")?.to_string(),
                password: frame.get_required("password")?.to_string(),
            }),
            "FILE_LIST" => Ok(Message::FileList),
            "FILE_CREATE" => Ok(Message::FileCreate {
                name: frame.get_required("name")?.to_string(),
            }),
            "FILE_OPEN" => Ok(Message::FileOpen {
                file_id: frame.file_id.clone().ok_or_else(|| EngineError::InvalidArguments {
                    field: "file_id".into(),
                })?,
            }),
            "FILE_DELETE" => Ok(Message::FileDelete {
                file_id: frame.file_id.clone().ok_or_else(|| EngineError::InvalidArguments {
                    field: "file_id".into(),
                })?,
            }),
            "TEXT_INSERT" => {
                let file_id = frame.file_id.clone().ok_or_else(|| EngineError::InvalidArguments {
                    field: "file_id".into(),
                })?;
                let position = frame.get_u32("position")?;
                let text = decode_escapes(frame.get_required("text")?);
                if text.chars().count() > self.max_insert_len {
                    return Err(EngineError::InvalidArguments {
                        field: "text (exceeds max_insert_len)".into(),
                    });
                }
                Ok(Message::TextInsert { file_id, position, text })
            }
            "TEXT_DELETE" => {
                let file_id = frame.file_id.clone().ok_or_else(|| EngineError::InvalidArguments {
                    field: "file_id".into(),
                })?;
                Ok(Message::TextDelete {
                    file_id,
                    position: frame.get_u32("position")?,
                    length: frame.get_u32("length")?,
                })
            }
            "SAVE" => {
                if frame.get("status").is_some() {
                    Ok(Message::SaveAck {
                        status: parse_status(frame.get_required("status")?)?,
                        message: frame.get("message").unwrap_or_default().to_string(),
                    })
                } else {
                    Ok(Message::Save {
                        file_id: frame.file_id.clone().ok_or_else(|| EngineError::InvalidArguments {
                            field: "file_id".into(),
                        })?,
                    })
                }
            }
            "CONNECT_ACK" => Ok(Message::ConnectAck {
                status: parse_status(frame.get_required("status")?)?,
                message: frame.get("message").unwrap_or_default().to_string(),
            }),
            "REGISTER_ACK" => Ok(Message::RegisterAck {
                status: parse_status(frame.get_required("status")?)?,
                message: frame.get("message").unwrap_or_default().to_string(),
            }),
            "LOGIN_ACK" => Ok(Message::LoginAck {
                status: parse_status(frame.get_required("status")?)?,
                message: frame.get("message").unwrap_or_default().to_string(),
            }),
            "FILE_DELETE_ACK" => Ok(Message::FileDeleteAck {
                status: parse_status(frame.get_required("status")?)?,
                message: frame.get("message").unwrap_or_default().to_string(),
            }),
            "FILE_LIST_RESP" => {
                let raw = frame.get("files").unwrap_or_default();
                let files = if raw.is_empty() {
                    Vec::new()
                } else {
                    raw.split('|')
                        .map(|entry| {
                            let mut parts = entry.splitn(3, KV_SEP);
                            let id = parts.next().unwrap_or_default().to_string();
                            let name = parts.next().unwrap_or_default().to_string();
                            let count: usize = parts.next().unwrap_or("0").parse().unwrap_or(0);
                            (id, name, count)
                        })
                        .collect()
                };
                Ok(Message::FileListResp { files })
            }
            "FILE_CONTENT" => {
                let file_id = frame.file_id.clone().ok_or_else(|| EngineError::InvalidArguments {
                    field: "file_id".into(),
                })?;
                let content = decode_escapes(frame.get_required("content")?);
                let users = frame
                    .get("users")
                    .unwrap_or_default()
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                let name = frame.get("name").map(str::to_string);
                Ok(Message::FileContent { file_id, content, users, name })
            }
            "TEXT_UPDATE" => {
                let file_id = frame.file_id.clone().ok_or_else(|| EngineError::InvalidArguments {
                    field: "file_id".into(),
                })?;
                let kind = match frame.get_required("operation")? {
                    "insert" => UpdateKind::Insert,
                    "delete" => UpdateKind::Delete,
                    other => {
                        return Err(EngineError::MalformedFrame {
                            reason: format!("unknown TEXT_UPDATE operation {other:?}"),
                        })
                    }
                };
                let position = frame.get_u32("position")?;
                let text = frame.get("text").map(|t| decode_escapes(t));
                let length = frame.get("length").map(|l| l.parse()).transpose().map_err(|_| {
                    EngineError::InvalidArguments {
                        field: "length".into(),
                    }
                })?;
                Ok(Message::TextUpdate { file_id, kind, position, text, length })
            }
            "ERROR" => Ok(Message::Error {
                message: frame.get("message").unwrap_or_default().to_string(),
            }),
            other => Err(EngineError::MalformedFrame {
                reason: format!("unknown TYPE {other:?}"),
            }),
        }
    }

    fn message_to_frame(&self, user_id: Option<UserId>, message: &Message) -> Frame {
        let mut data = BTreeMap::new();
        let mut file_id = None;

        match message {
            Message::Connect | Message::Disconnect | Message::FileList => {}
            Message::ConnectAck { status, message } | Message::RegisterAck { status, message }
            | Message::LoginAck { status, message } | Message::FileDeleteAck { status, message }
            | Message::SaveAck { status, message } => {
                data.insert("status".to_string(), status.to_string());
                data.insert("message".to_string(), message.clone());
            }
            Message::Register { username, password } | Message::Login { username, password } => {
                data.insert("username".to_string(), username.clone());
                data.insert("password".to_string(), password.clone());
            }
            Message::FileListResp { files } => {
                let joined = files
                    .iter()
                    .map(|(id, name, count)| format!("{id}{KV_SEP}{name}{KV_SEP}{count}"))
                    .collect::<Vec<_>>()
                    .join("|");
                data.insert("files".to_string(), joined);
            }
            Message::FileCreate { name } => {
                data.insert("name".to_string(), name.clone());
            }
            Message::FileOpen { file_id: id } | Message::FileDelete { file_id: id } | Message::Save { file_id: id } => {
                file_id = Some(id.clone());
            }
            Message::FileContent { file_id: id, content, users, name } => {
                file_id = Some(id.clone());
                data.insert("content".to_string(), encode_escapes(content));
                data.insert("users".to_string(), users.join(","));
                if let Some(name) = name {
                    data.insert("name".to_string(), name.clone());
                }
            }
            Message::TextInsert { file_id: id, position, text } => {
                file_id = Some(id.clone());
                data.insert("position".to_string(), position.to_string());
                data.insert("text".to_string(), encode_escapes(text));
            }
            Message::TextDelete { file_id: id, position, length } => {
                file_id = Some(id.clone());
                data.insert("position".to_string(), position.to_string());
                data.insert("length".to_string(), length.to_string());
            }
            Message::TextUpdate { file_id: id, kind, position, text, length } => {
                file_id = Some(id.clone());
                data.insert(
                    "operation".to_string(),
                    match kind {
                        UpdateKind::Insert => "insert".to_string(),
                        UpdateKind::Delete => "delete".to_string(),
                    },
                );
                data.insert("position".to_string(), position.to_string());
                if let Some(text) = text {
                    data.insert("text".to_string(), encode_escapes(text));
                }
                if let Some(length) = length {
                    data.insert("length".to_string(), length.to_string());
                }
            }
            Message::Error { message } => {
                data.insert("message".to_string(), message.clone());
            }
        }

        Frame {
            kind: message.kind_name().to_string(),
            user_id,
            file_id,
            data,
            timestamp: now_millis(),
        }
    }
}

fn parse_status(raw: &str) -> Result<Status, EngineError> {
    match raw {
        "success" => Ok(Status::Success),
        "fail" => Ok(Status::Fail),
        other => Err(EngineError::MalformedFrame {
            reason: format!("unknown status {other:?}"),
        }),
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Codec {
        Codec::new(4 * 1024 * 1024, 10_000)
    }

    #[test]
    fn round_trip_text_insert() {
        let c = codec();
        let msg = Message::TextInsert {
            file_id: "f1".into(),
            position: 4,
            text: "hi".into(),
        };
        let encoded = c.encode(Some("u1".into()), &msg);
        let decoded = c.decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn control_character_round_trip_s6() {
        let c = codec();
        let line = "TEXT_INSERT|u1|f1|position:4,text:__NEWLINE__|1000";
        let decoded = c.decode(line).unwrap();
        match decoded {
            Message::TextInsert { text, .. } => assert_eq!(text, "\n"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_line() {
        let c = codec();
        assert!(c.decode("").is_err());
    }

    #[test]
    fn rejects_wrong_field_count() {
        let c = codec();
        assert!(c.decode("LOGIN|u1|f1|empty").is_err());
    }

    #[test]
    fn rejects_unknown_type() {
        let c = codec();
        assert!(c.decode("FROB|u1|null|empty|0").is_err());
    }

    #[test]
    fn rejects_non_integer_timestamp() {
        let c = codec();
        assert!(c.decode("FILE_LIST|u1|null|empty|notanumber").is_err());
    }

    #[test]
    fn null_tokens_decode_to_none() {
        let c = codec();
        let decoded = c.decode("FILE_LIST|null|null|empty|0").unwrap();
        assert_eq!(decoded, Message::FileList);
    }

    #[test]
    fn file_list_resp_encodes_pipe_separated_entries() {
        let c = codec();
        let msg = Message::FileListResp {
            files: vec![("f1".into(), "a.txt".into(), 2), ("f2".into(), "b.txt".into(), 0)],
        };
        let encoded = c.encode(None, &msg);
        assert!(encoded.contains("f1:a.txt:2|f2:b.txt:0"));
    }

    #[test]
    fn frame_too_large_rejected() {
        let line = format!("TEXT_INSERT|u1|f1|position:0,text:{}|0", "x".repeat(100));
        assert!(Frame::parse(&line, 10).is_err());
    }

    #[test]
    fn save_and_save_ack_share_wire_type_but_decode_distinctly() {
        let c = codec();
        let save = Message::Save { file_id: "f1".into() };
        let ack = Message::SaveAck {
            status: Status::Success,
            message: "saved".into(),
        };
        assert_eq!(save.kind_name(), ack.kind_name());

        let decoded_save = c.decode(&c.encode(Some("u1".into()), &save)).unwrap();
        assert_eq!(decoded_save, save);
        let decoded_ack = c.decode(&c.encode(None, &ack)).unwrap();
        assert_eq!(decoded_ack, ack);
    }

    #[test]
    fn round_trip_text_update_delete() {
        let c = codec();
        let msg = Message::TextUpdate {
            file_id: "f1".into(),
            kind: UpdateKind::Delete,
            position: 2,
            text: None,
            length: Some(3),
        };
        let decoded = c.decode(&c.encode(None, &msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trip_file_content_with_users() {
        let c = codec();
        let msg = Message::FileContent {
            file_id: "f1".into(),
            content: "hello\nworld".into(),
            users: vec!["alice".into(), "bob".into()],
            name: Some("notes.txt".into()),
        };
        let decoded = c.decode(&c.encode(None, &msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trip_file_list_resp() {
        let c = codec();
        let msg = Message::FileListResp {
            files: vec![("f1".into(), "a.txt".into(), 2)],
        };
        let decoded = c.decode(&c.encode(None, &msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trip_acks_and_error() {
        let c = codec();
        for msg in [
            Message::ConnectAck { status: Status::Success, message: "ok".into() },
            Message::RegisterAck { status: Status::Fail, message: "taken".into() },
            Message::LoginAck { status: Status::Success, message: "".into() },
            Message::FileDeleteAck { status: Status::Success, message: "".into() },
            Message::Error { message: "boom".into() },
        ] {
            let decoded = c.decode(&c.encode(None, &msg)).unwrap();
            assert_eq!(decoded, msg);
        }
    }
}
