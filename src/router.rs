//! Ties the wire layer to the engine: authentication gate, per-message
//! dispatch, broadcast fan-out, and the global concurrent document/session
//! tables.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::codec::{Codec, Message, Status, UpdateKind};
use crate::config::Config;
use crate::document::Document;
use crate::error::EngineError;
use crate::session::Session;
use crate::storage::DocumentStore;
use crate::users::UserStore;
use crate::{FileId, UserId};

/// Global, concurrently-accessed router state: documents and sessions are
/// both keyed concurrent maps, per the concurrency model. Each document
/// carries its own lock (see [`crate::document::Document`]); sessions are
/// reached through `Arc` so a session can be looked up from the thread that
/// dispatched the originating edit.
pub struct Router {
    documents: DashMap<FileId, Arc<Document>>,
    sessions: DashMap<UserId, Arc<Session>>,
    users: Arc<dyn UserStore>,
    storage: Arc<dyn DocumentStore>,
    codec: Codec,
    config: Config,
}

impl Router {
    pub fn new(users: Arc<dyn UserStore>, storage: Arc<dyn DocumentStore>, config: Config) -> Self {
        let codec = Codec::new(config.max_frame_size, config.max_insert_len);
        Self {
            documents: DashMap::new(),
            sessions: DashMap::new(),
            users,
            storage,
            codec,
            config,
        }
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Dispatches one decoded [`Message`] from `session`, returning the
    /// direct reply (if any) the caller should encode and send back to the
    /// originator. Broadcasts, if any, are sent from here directly.
    pub fn dispatch(&self, session: &Arc<Session>, message: Message) -> Result<Option<Message>, EngineError> {
        match message {
            Message::Connect => Ok(Some(Message::ConnectAck {
                status: Status::Success,
                message: "connected".to_string(),
            })),
            Message::Disconnect => {
                self.close_session(session);
                Ok(None)
            }
            Message::Register { username, password } => Ok(Some(self.handle_register(session, &username, &password))),
            Message::Login { username, password } => Ok(Some(self.handle_login(session, &username, &password))),
            Message::FileList => self.handle_file_list(session).map(Some),
            Message::FileCreate { name } => self.handle_file_create(session, name).map(Some),
            Message::FileOpen { file_id } => self.handle_file_open(session, file_id).map(Some),
            Message::FileDelete { file_id } => Ok(Some(self.handle_file_delete(session, file_id)?)),
            Message::TextInsert { file_id, position, text } => self.handle_text_insert(session, file_id, position, text),
            Message::TextDelete { file_id, position, length } => self.handle_text_delete(session, file_id, position, length),
            Message::Save { file_id } => self.handle_save(session, file_id).map(Some),
            other => Err(EngineError::MalformedFrame {
                reason: format!("{} is not a client-originated message", other.kind_name()),
            }),
        }
    }

    fn require_authenticated(&self, session: &Session) -> Result<UserId, EngineError> {
        session.user_id().filter(|_| session.is_authenticated()).ok_or(EngineError::AuthRequired)
    }

    fn handle_register(&self, session: &Session, username: &str, password: &str) -> Message {
        if session.is_authenticated() {
            return Message::RegisterAck {
                status: Status::Fail,
                message: "already authenticated".to_string(),
            };
        }
        match self.users.register(username, password) {
            Ok(_) => Message::RegisterAck {
                status: Status::Success,
                message: "registered".to_string(),
            },
            Err(e) => {
                crate::error::log_boundary(None, None, &e);
                Message::RegisterAck {
                    status: Status::Fail,
                    message: e.wire_message(),
                }
            }
        }
    }

    fn handle_login(&self, session: &Arc<Session>, username: &str, password: &str) -> Message {
        if session.is_authenticated() {
            return Message::LoginAck {
                status: Status::Fail,
                message: "already authenticated".to_string(),
            };
        }
        match self.users.authenticate(username, password) {
            Ok(user_id) => {
                session.authenticate(user_id.clone());
                self.sessions.insert(user_id, session.clone());
                Message::LoginAck {
                    status: Status::Success,
                    message: "logged in".to_string(),
                }
            }
            Err(e) => {
                crate::error::log_boundary(None, None, &e);
                Message::LoginAck {
                    status: Status::Fail,
                    message: e.wire_message(),
                }
            }
        }
    }

    fn handle_file_list(&self, session: &Session) -> Result<Message, EngineError> {
        self.require_authenticated(session)?;
        let files = self
            .documents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().file_name.clone(), entry.value().participant_count()))
            .collect();
        Ok(Message::FileListResp { files })
    }

    fn handle_file_create(&self, session: &Arc<Session>, name: String) -> Result<Message, EngineError> {
        let user_id = self.require_authenticated(session)?;
        if name.trim().is_empty() {
            return Err(EngineError::InvalidArguments { field: "name".into() });
        }
        let file_id = Uuid::new_v4().to_string();
        let doc = Arc::new(Document::create(file_id.clone(), name.clone(), user_id.clone(), self.config.history_depth));
        doc.add_participant(user_id.clone());
        self.documents.insert(file_id.clone(), doc);
        session.open_file(file_id.clone());
        Ok(Message::FileContent {
            file_id,
            content: String::new(),
            users: vec![user_id],
            name: Some(name),
        })
    }

    fn handle_file_open(&self, session: &Arc<Session>, file_id: FileId) -> Result<Message, EngineError> {
        let user_id = self.require_authenticated(session)?;

        if let Some(doc) = self.documents.get(&file_id) {
            doc.add_participant(user_id);
            session.open_file(file_id.clone());
            let snapshot = doc.copy();
            return Ok(Message::FileContent {
                file_id: snapshot.file_id,
                content: snapshot.content,
                users: snapshot.participants,
                name: Some(snapshot.file_name),
            });
        }

        match self.storage.load(&file_id)? {
            Some((name, content)) => {
                let doc = Arc::new(Document::from_content(
                    file_id.clone(),
                    name.clone(),
                    user_id.clone(),
                    content.clone(),
                    self.config.history_depth,
                ));
                doc.add_participant(user_id.clone());
                self.documents.insert(file_id.clone(), doc);
                session.open_file(file_id.clone());
                Ok(Message::FileContent {
                    file_id,
                    content,
                    users: vec![user_id],
                    name: Some(name),
                })
            }
            None => Err(EngineError::NotFound { file_id }),
        }
    }

    fn handle_file_delete(&self, session: &Session, file_id: FileId) -> Result<Message, EngineError> {
        let user_id = self.require_authenticated(session)?;
        let doc = self.documents.get(&file_id).ok_or_else(|| EngineError::NotFound { file_id: file_id.clone() })?;

        if doc.participant_count() > 1 {
            return Ok(Message::FileDeleteAck {
                status: Status::Fail,
                message: "file has other participants".to_string(),
            });
        }
        if self.config.restrict_delete_to_creator && doc.creator != user_id {
            return Ok(Message::FileDeleteAck {
                status: Status::Fail,
                message: "only the creator may delete this file".to_string(),
            });
        }
        drop(doc);

        self.storage.delete(&file_id)?;
        self.documents.remove(&file_id);
        Ok(Message::FileDeleteAck {
            status: Status::Success,
            message: "deleted".to_string(),
        })
    }

    fn handle_text_insert(
        &self,
        session: &Arc<Session>,
        file_id: FileId,
        position: u32,
        text: String,
    ) -> Result<Option<Message>, EngineError> {
        let user_id = self.require_authenticated(session)?;
        if !session.has_open(&file_id) {
            return Err(EngineError::NotOpen { file_id });
        }
        let doc = self.documents.get(&file_id).ok_or_else(|| EngineError::NotFound { file_id: file_id.clone() })?;

        let result = doc.insert(position, text.clone(), user_id.clone(), self.config.insert_window());
        if !result.success {
            return Err(EngineError::OperationRejected {
                file_id,
                reason: "insert could not be placed".to_string(),
            });
        }
        drop(doc);

        self.broadcast(
            &file_id,
            &user_id,
            &Message::TextUpdate {
                file_id: file_id.clone(),
                kind: UpdateKind::Insert,
                position: result.applied_position,
                text: Some(text),
                length: None,
            },
        );
        Ok(None)
    }

    fn handle_text_delete(
        &self,
        session: &Arc<Session>,
        file_id: FileId,
        position: u32,
        length: u32,
    ) -> Result<Option<Message>, EngineError> {
        let user_id = self.require_authenticated(session)?;
        if !session.has_open(&file_id) {
            return Err(EngineError::NotOpen { file_id });
        }
        let doc = self.documents.get(&file_id).ok_or_else(|| EngineError::NotFound { file_id: file_id.clone() })?;

        let result = doc.delete(position, length, user_id.clone(), self.config.delete_window());
        if !result.success {
            return Err(EngineError::OperationRejected {
                file_id,
                reason: "delete could not be placed".to_string(),
            });
        }
        drop(doc);

        self.broadcast(
            &file_id,
            &user_id,
            &Message::TextUpdate {
                file_id: file_id.clone(),
                kind: UpdateKind::Delete,
                position: result.applied_position,
                text: None,
                length: Some(result.applied_length),
            },
        );
        Ok(None)
    }

    fn handle_save(&self, session: &Session, file_id: FileId) -> Result<Message, EngineError> {
        self.require_authenticated(session)?;
        if !session.has_open(&file_id) {
            return Err(EngineError::NotOpen { file_id });
        }
        let doc = self.documents.get(&file_id).ok_or_else(|| EngineError::NotFound { file_id: file_id.clone() })?;
        let content = doc.content();
        let file_name = doc.file_name.clone();
        match self.storage.save(&file_id, &file_name, &content) {
            Ok(()) => {
                doc.mark_saved();
                Ok(Message::SaveAck {
                    status: Status::Success,
                    message: "saved".to_string(),
                })
            }
            Err(e) => {
                crate::error::log_boundary(session.user_id().as_ref(), Some(&file_id), &e);
                Ok(Message::SaveAck {
                    status: Status::Fail,
                    message: e.wire_message(),
                })
            }
        }
    }

    /// Sends `message` to every session with `file_id` open except `exclude`
    /// (the originator). Never called while a document lock is held.
    fn broadcast(&self, file_id: &FileId, exclude: &UserId, message: &Message) {
        let line = self.codec.encode(None, message);
        for entry in self.sessions.iter() {
            if entry.key() == exclude {
                continue;
            }
            let session = entry.value();
            if session.has_open(file_id) && session.is_connected() {
                if let Err(e) = session.send_line(&line) {
                    crate::error::log_boundary(Some(entry.key()), Some(file_id), &e);
                }
            }
        }
    }

    /// Runs the disconnect cleanup path: closes every file the session had
    /// open (persisting and evicting documents whose last participant just
    /// left), then removes the session from the table.
    pub fn close_session(&self, session: &Arc<Session>) {
        let user_id = session.user_id();
        for file_id in session.open_files() {
            self.leave_document(&file_id, user_id.as_ref());
        }
        if let Some(user_id) = &user_id {
            self.sessions.remove(user_id);
        }
        session.begin_close();
    }

    fn leave_document(&self, file_id: &FileId, user_id: Option<&UserId>) {
        let Some(doc) = self.documents.get(file_id) else { return };
        if let Some(user_id) = user_id {
            doc.remove_participant(user_id);
        }
        let should_evict = doc.participant_count() == 0;
        if should_evict {
            let content = doc.content();
            let file_name = doc.file_name.clone();
            if let Err(e) = self.storage.save(file_id, &file_name, &content) {
                crate::error::log_boundary(user_id, Some(file_id), &e);
            }
        }
        drop(doc);
        if should_evict {
            self.documents.remove(file_id);
        }
    }

    /// Persists every dirty document in the table. Used by the auto-save
    /// scheduler tick and by server shutdown.
    pub fn save_all_dirty(&self) {
        for entry in self.documents.iter() {
            let doc = entry.value();
            if !doc.is_dirty() {
                continue;
            }
            let content = doc.content();
            if let Err(e) = self.storage.save(entry.key(), &doc.file_name, &content) {
                crate::error::log_boundary(None, Some(entry.key()), &e);
                continue;
            }
            doc.mark_saved();
        }
    }
}
