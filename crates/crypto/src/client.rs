//! The key service the application talks to.
//!
//! `KeyService` drives the cryptographic steps and persists their results
//! through the store traits. Persistence happens only after a cryptographic
//! step has fully succeeded, so a failure or a cancelled future leaves no
//! partial record. Store reads are retried per [`RetryPolicy`]; cryptographic
//! steps never are.
//!
//! [`RetryPolicy`]: crate::retry::RetryPolicy

use std::sync::Arc;

use chrono::Utc;
use zeroize::Zeroizing;

use kemchat_shared::api::auth::SignupRequest;
use kemchat_shared::api::conversation::ConversationStatus;
use kemchat_shared::ids::{ConversationId, UserId};

use crate::agreement::{
    self, ConversationKey, InitiatedConversation, KeyAgreementEvent, KeyAgreementState,
};
use crate::config::CryptoConfig;
use crate::error::CryptoError;
use crate::identity::{self, KemPrivateKey, KemPublicKey, RegisteredIdentity};
use crate::master_key::{self, DecryptionKey, MasterKeyMaterial, Salt};
use crate::message::{self, DisplayMessage};
use crate::payload::{EncapsulationPayload, KeyWrapPayload, MessagePayload, Payload};
use crate::retry::retry_io;
use crate::session::Session;
use crate::storage::SqliteStore;
use crate::store::{
    ConversationRecord, ConversationStore, MessageStore, NewConversation, Page,
    StoredMessageMeta, UserDirectory, UserRecord,
};
use crate::verifier;

pub struct KeyService {
    users: Arc<dyn UserDirectory>,
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    config: CryptoConfig,
}

impl KeyService {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        conversations: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageStore>,
        config: CryptoConfig,
    ) -> Self {
        Self {
            users,
            conversations,
            messages,
            config,
        }
    }

    /// All three stores backed by one SQLite database.
    pub fn with_sqlite(store: Arc<SqliteStore>, config: CryptoConfig) -> Self {
        Self::new(store.clone(), store.clone(), store, config)
    }

    pub fn config(&self) -> &CryptoConfig {
        &self.config
    }

    /// Argon2id on the blocking pool with the configured cost parameters.
    pub async fn derive_master_key(
        &self,
        password: &str,
        salt: Salt,
    ) -> Result<MasterKeyMaterial, CryptoError> {
        master_key::derive_master_key_async(
            Zeroizing::new(password.to_string()),
            salt,
            self.config.kdf,
        )
        .await
    }

    /// Generate a salt, derive the master key and a wrapped identity keypair.
    /// Nothing is stored.
    pub async fn create_identity(&self, password: &str) -> Result<RegisteredIdentity, CryptoError> {
        let password = Zeroizing::new(password.to_string());
        let params = self.config.kdf;
        tokio::task::spawn_blocking(move || identity::register_identity(&password, &params)).await?
    }

    /// Create an identity, publish it, and open a session for the new user.
    ///
    /// The directory receives only what a signup request carries; the
    /// authentication key is replaced by its verifier before storage.
    pub async fn register(
        &self,
        username: &str,
        display_name: &str,
        password: &str,
    ) -> Result<Session, CryptoError> {
        let identity = self.create_identity(password).await?;
        let request = identity.signup_request(username, display_name);
        request
            .validate()
            .map_err(|e| CryptoError::InvalidPayload(e.to_string()))?;

        let record = self.user_record_from_signup(&request).await?;
        let user_id = record.id;
        self.users.store(record).await?;

        let private_key = identity::unlock_private_key(
            &identity.encrypted_private_key,
            &identity.master.decryption_key,
        )?;
        tracing::info!(%user_id, "user registered");
        Ok(Session::new(
            user_id,
            identity.master.decryption_key.clone(),
            private_key,
        ))
    }

    async fn user_record_from_signup(
        &self,
        request: &SignupRequest,
    ) -> Result<UserRecord, CryptoError> {
        let authentication_key = verifier::decode_authentication_key(&request.authentication_key)?;
        let params = self.config.kdf;
        let verifier = tokio::task::spawn_blocking(move || {
            verifier::hash_authentication_key(&authentication_key, &params)
        })
        .await??;

        Ok(UserRecord {
            id: UserId::new(),
            username: request.username.clone(),
            display_name: request.display_name.clone(),
            public_key: KemPublicKey::from_base64(&request.public_key)?,
            encrypted_private_key: KeyWrapPayload::from_base64(&request.encrypted_private_key)?,
            salt: Salt::from_base64(&request.salt)?,
            verifier,
            created_at: Utc::now(),
        })
    }

    /// Look up the user's salt, derive the master key, prove the
    /// authentication key against the stored verifier, and unlock the
    /// private key.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session, CryptoError> {
        let users = &self.users;
        let record = retry_io(&self.config.retry, "lookup_by_username", move || {
            users.lookup_by_username(username)
        })
        .await?;

        let master = self.derive_master_key(password, record.salt).await?;

        let request = master.login_request(username);
        let presented = verifier::decode_authentication_key(&request.authentication_key)?;
        let stored_verifier = record.verifier.clone();
        tokio::task::spawn_blocking(move || {
            verifier::verify_authentication_key(&presented, &stored_verifier)
        })
        .await?
        .inspect_err(|_| tracing::warn!(user_id = %record.id, "login rejected"))?;

        let private_key =
            identity::unlock_private_key(&record.encrypted_private_key, &master.decryption_key)?;
        if private_key.public_key() != record.public_key {
            return Err(CryptoError::InvalidKey(
                "unlocked private key does not match the published public key".into(),
            ));
        }

        tracing::info!(user_id = %record.id, "user logged in");
        Ok(Session::new(
            record.id,
            master.decryption_key.clone(),
            private_key,
        ))
    }

    /// Encapsulate against the recipient's long-term public key and wrap the
    /// secret for the initiator.
    pub fn start_conversation(
        &self,
        recipient_public_key: &KemPublicKey,
        decryption_key: &DecryptionKey,
    ) -> Result<InitiatedConversation, CryptoError> {
        agreement::initiate(recipient_public_key, decryption_key)
    }

    /// Decapsulate the artifact and wrap the secret for the accepter.
    pub fn accept_conversation(
        &self,
        artifact: &EncapsulationPayload,
        private_key: &KemPrivateKey,
        decryption_key: &DecryptionKey,
    ) -> Result<KeyWrapPayload, CryptoError> {
        agreement::accept(artifact, private_key, decryption_key)
    }

    /// Open a conversation with `recipient_id`. Messaging oneself creates an
    /// accepted conversation with a single wrapped key and no artifact.
    pub async fn propose_conversation(
        &self,
        session: &Session,
        recipient_id: UserId,
    ) -> Result<ConversationId, CryptoError> {
        let decryption_key = session.decryption_key()?;
        let me = session.user_id();

        let new = if recipient_id == me {
            KeyAgreementState::Uninitiated.apply(KeyAgreementEvent::ProposeToSelf)?;
            let (_, wrapped) = agreement::initiate_self(decryption_key)?;
            NewConversation {
                initiator_id: me,
                participants: vec![me],
                artifact: None,
                initiator_wrapped_key: wrapped,
                status: ConversationStatus::Accepted,
            }
        } else {
            KeyAgreementState::Uninitiated.apply(KeyAgreementEvent::Propose)?;
            let users = &self.users;
            let recipient = retry_io(&self.config.retry, "lookup_user", move || {
                users.lookup(recipient_id)
            })
            .await?;
            let initiated = self.start_conversation(&recipient.public_key, decryption_key)?;
            NewConversation {
                initiator_id: me,
                participants: vec![me, recipient_id],
                artifact: Some(initiated.artifact),
                initiator_wrapped_key: initiated.wrapped_key,
                status: ConversationStatus::Pending,
            }
        };

        self.conversations.create(new).await
    }

    async fn fetch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<ConversationRecord, CryptoError> {
        let conversations = &self.conversations;
        retry_io(&self.config.retry, "fetch_conversation", move || {
            conversations.fetch_conversation(conversation_id)
        })
        .await
    }

    /// Accept a pending request addressed to the session's user.
    ///
    /// A failed decapsulation leaves the request pending and stores nothing.
    pub async fn accept_request(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> Result<(), CryptoError> {
        let private_key = session.private_key()?;
        let decryption_key = session.decryption_key()?;

        let record = self.fetch_conversation(conversation_id).await?;
        ensure_recipient(&record, session.user_id())?;
        KeyAgreementState::from(record.status).apply(KeyAgreementEvent::Accept)?;

        let conversations = &self.conversations;
        let artifact = retry_io(&self.config.retry, "fetch_artifact", move || {
            conversations.fetch_artifact(conversation_id)
        })
        .await?;

        let wrapped = self
            .accept_conversation(&artifact, private_key, decryption_key)
            .inspect_err(|e| {
                tracing::warn!(%conversation_id, error = %e, "conversation acceptance failed");
            })?;

        self.conversations
            .record_acceptance(conversation_id, session.user_id(), wrapped)
            .await
    }

    /// Deny a pending request addressed to the session's user. No key
    /// material is created.
    pub async fn deny_request(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> Result<(), CryptoError> {
        session.decryption_key()?;
        let record = self.fetch_conversation(conversation_id).await?;
        ensure_recipient(&record, session.user_id())?;
        KeyAgreementState::from(record.status).apply(KeyAgreementEvent::Deny)?;
        self.conversations.record_denial(conversation_id).await
    }

    /// Unwrap the session user's own record for the conversation.
    ///
    /// A missing record or an unwrap failure surfaces as
    /// `CryptoError::Decryption`; storage failures propagate unchanged.
    pub async fn conversation_key(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> Result<ConversationKey, CryptoError> {
        let decryption_key = session.decryption_key()?;
        let user_id = session.user_id();
        let conversations = &self.conversations;
        let wrapped = retry_io(&self.config.retry, "fetch_wrapped_key", move || {
            conversations.fetch_wrapped_key(conversation_id, user_id)
        })
        .await
        .map_err(|e| match e {
            CryptoError::NotFound(detail) => {
                CryptoError::Decryption(format!("conversation key unavailable: {detail}"))
            }
            other => other,
        })?;

        agreement::unwrap_conversation_key(&wrapped, decryption_key).map_err(|e| match e {
            CryptoError::Unwrap(detail) | CryptoError::InvalidKey(detail) => {
                CryptoError::Decryption(format!("conversation key unavailable: {detail}"))
            }
            other => other,
        })
    }

    pub async fn encrypt_outgoing(
        &self,
        session: &Session,
        plaintext: &str,
        conversation_id: ConversationId,
    ) -> Result<MessagePayload, CryptoError> {
        let key = self.conversation_key(session, conversation_id).await?;
        message::encrypt_message(plaintext, &key)
    }

    pub async fn decrypt_incoming(
        &self,
        session: &Session,
        ciphertext: &MessagePayload,
        conversation_id: ConversationId,
    ) -> Result<String, CryptoError> {
        let key = self.conversation_key(session, conversation_id).await?;
        message::decrypt_message(ciphertext, &key)
    }

    /// Encrypt and store a message in an accepted conversation.
    pub async fn send_message(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        plaintext: &str,
    ) -> Result<StoredMessageMeta, CryptoError> {
        let record = self.fetch_conversation(conversation_id).await?;
        if record.status != ConversationStatus::Accepted {
            return Err(CryptoError::InvalidTransition {
                from: KeyAgreementState::from(record.status).to_string(),
                event: "send".into(),
            });
        }

        let ciphertext = self
            .encrypt_outgoing(session, plaintext, conversation_id)
            .await?;
        self.messages
            .append(conversation_id, session.user_id(), ciphertext)
            .await
    }

    /// One page of history, newest first. Messages that fail to decrypt are
    /// returned as [`DisplayMessage::Undecryptable`], never dropped.
    pub async fn load_messages(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        page: Page,
    ) -> Result<Vec<DisplayMessage>, CryptoError> {
        let key = match self.conversation_key(session, conversation_id).await {
            Ok(key) => Some(key),
            Err(e @ CryptoError::SessionCleared) => return Err(e),
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                tracing::warn!(%conversation_id, error = %e, "conversation key unavailable");
                None
            }
        };

        let messages = &self.messages;
        let stored = retry_io(&self.config.retry, "list_messages", move || {
            messages.list(conversation_id, page)
        })
        .await?;

        let rendered: Vec<DisplayMessage> = stored
            .iter()
            .map(|m| DisplayMessage::render(m, key.as_ref()))
            .collect();
        let undecryptable = rendered.iter().filter(|m| m.is_undecryptable()).count();
        if undecryptable > 0 {
            tracing::warn!(%conversation_id, undecryptable, "messages could not be decrypted");
        }
        Ok(rendered)
    }
}

/// Only a participant other than the initiator may answer a request.
fn ensure_recipient(record: &ConversationRecord, user_id: UserId) -> Result<(), CryptoError> {
    if !record.is_participant(user_id) || record.initiator_id == user_id {
        return Err(CryptoError::NotFound(format!(
            "pending request for {user_id} in conversation {}",
            record.id
        )));
    }
    Ok(())
}
