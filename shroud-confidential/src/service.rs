use std::{future::Future, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use shroud_events::{
    ChannelKey, ResultEvent, ResultListeners, ResultPayload, ShroudEventsConfig, SubscriberError,
};
use shroud_utils::{encryption::EncryptionError, Cipher, Nonce, PlaintextElement};
use thiserror::Error;
use tracing::instrument;
use x25519_dalek::PublicKey;

use crate::{
    config::ShroudConfidentialConfig,
    envelope::build_request,
    key_management::{KeyManagementError, X25519KeyPair},
    types::{Argument, ComputationRequest, DecryptedResult, EnvelopeError, RequestState},
};

type Result<T> = std::result::Result<T, ConfidentialClientError>;

/// Hands a request over to whatever transport reaches the cluster.
///
/// The transport itself is out of scope for this crate; callers implement
/// this for their RPC client, and tests implement it in-process.
pub trait ComputationSubmitter: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn submit(
        &self,
        request: &ComputationRequest,
    ) -> impl Future<Output = std::result::Result<(), Self::Error>> + Send;
}

/// Nonces issued under long-lived client keys.
///
/// Keyed by `(public key, nonce)`; the value is the computation offset of the
/// request that first used the pair. Entries are only dropped by
/// [`NonceRegistry::forget`], which `ConfidentialClient::rotate_session_key`
/// calls, so the registry grows by one entry per request until the session
/// key is rotated. Clients with long sessions should rotate periodically.
#[derive(Debug, Default)]
pub struct NonceRegistry {
    issued: DashMap<([u8; 32], Nonce), u64>,
}

impl NonceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `nonce` was used with `public_key`
    ///
    /// # Errors
    ///
    /// Returns `ConfidentialClientError::NonceReuse` if the pair was already
    /// recorded
    pub fn register(
        &self,
        public_key: &PublicKey,
        nonce: Nonce,
        computation_offset: u64,
    ) -> Result<()> {
        match self.issued.entry((public_key.to_bytes(), nonce)) {
            Entry::Occupied(entry) => Err(ConfidentialClientError::NonceReuse {
                nonce: nonce.to_u128(),
                computation_offset: *entry.get(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(computation_offset);
                Ok(())
            }
        }
    }

    /// Forgets every nonce recorded for `public_key`, after it was rotated out
    pub fn forget(&self, public_key: &PublicKey) {
        let key = public_key.to_bytes();
        self.issued.retain(|(issued_key, _), _| *issued_key != key);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.issued.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issued.is_empty()
    }
}

/// A request encrypted and ready to submit, together with what the client
/// needs to read its result
#[derive(Debug)]
pub struct PreparedRequest {
    request: ComputationRequest,
    cipher: Cipher,
    state: RequestState,
}

impl PreparedRequest {
    #[must_use]
    pub const fn request(&self) -> &ComputationRequest {
        &self.request
    }

    #[must_use]
    pub const fn state(&self) -> RequestState {
        self.state
    }

    #[must_use]
    pub fn with_plaintext_arguments(mut self, arguments: Vec<Argument>) -> Self {
        self.request = self.request.with_plaintext_arguments(arguments);
        self
    }

    #[must_use]
    pub fn with_recipient(mut self, public_key: &PublicKey, nonce: Nonce) -> Self {
        self.request = self.request.with_recipient(public_key, nonce);
        self
    }

    /// Decrypts a result addressed to the sender of this request
    ///
    /// # Errors
    ///
    /// Returns `ConfidentialClientError::ForeignRecipient` if the event
    /// announces a different encryption key, plus the errors of
    /// [`decrypt_event`]
    pub fn decrypt(&self, event: ResultEvent) -> Result<DecryptedResult> {
        if let ResultPayload::Encrypted {
            encryption_key: Some(key),
            ..
        } = &event.payload
        {
            if *key != self.request.sender_public_key {
                return Err(ConfidentialClientError::ForeignRecipient {
                    event_name: event.event_name,
                });
            }
        }
        decrypt_event(&self.cipher, Some(self.request.result_nonce()), event)
    }

    fn advance(&mut self, next: RequestState) -> Result<()> {
        self.state = self.state.transition(next)?;
        Ok(())
    }
}

/// Client side of the confidential-request protocol.
///
/// The `ConfidentialClient` handles:
/// - Key exchange with the configured cluster keys, in fold order
/// - Encrypting inputs into requests with fresh nonces
/// - Awaiting the result event of each request with a bounded wait
/// - Decrypting results with the nonce the result announces, or the one the
///   client supplied
pub struct ConfidentialClient {
    /// Cluster node public keys, in fold order
    cluster_keys: Vec<PublicKey>,
    /// Registry the result dispatcher delivers events to
    listeners: ResultListeners,
    /// Maximum wait for a result event
    result_timeout: Duration,
    /// Long-lived key pair, if the client does not use one pair per request
    session_key: Option<X25519KeyPair>,
    /// Nonces already used with `session_key`
    nonces: NonceRegistry,
}

impl ConfidentialClient {
    /// Constructor
    ///
    /// # Errors
    ///
    /// Returns `KeyManagementError::EmptyPeerSet` if `cluster_keys` is empty
    pub fn new(
        cluster_keys: Vec<PublicKey>,
        listeners: ResultListeners,
        result_timeout: Duration,
    ) -> Result<Self> {
        if cluster_keys.is_empty() {
            return Err(KeyManagementError::EmptyPeerSet.into());
        }
        Ok(Self {
            cluster_keys,
            listeners,
            result_timeout,
            session_key: None,
            nonces: NonceRegistry::new(),
        })
    }

    /// Builds a client from both crates' configuration sections
    ///
    /// # Errors
    ///
    /// Fails if the configured cluster keys are missing or malformed
    pub fn from_config(
        config: &ShroudConfidentialConfig,
        events_config: &ShroudEventsConfig,
        listeners: ResultListeners,
    ) -> Result<Self> {
        let client = Self::new(
            config.cluster_keys()?,
            listeners,
            events_config.result_timeout(),
        )?;
        if config.reuse_session_key {
            return Ok(client.with_session_key(X25519KeyPair::generate()));
        }
        Ok(client)
    }

    /// Uses `keypair` for every request instead of a fresh pair per request
    #[must_use]
    pub fn with_session_key(mut self, keypair: X25519KeyPair) -> Self {
        self.session_key = Some(keypair);
        self
    }

    /// Rotates the session key, if any, and drops its nonce history
    pub fn rotate_session_key(&mut self) {
        if let Some(keypair) = self.session_key.as_mut() {
            self.nonces.forget(&keypair.public_key());
            keypair.rotate_keys();
            tracing::info!(
                target = "shroud-confidential",
                event = "session_key_rotated",
                public_key = %hex::encode(keypair.public_key().as_bytes()),
                "Rotated session key"
            );
        }
    }

    #[must_use]
    pub fn session_public_key(&self) -> Option<PublicKey> {
        self.session_key.as_ref().map(X25519KeyPair::public_key)
    }

    #[must_use]
    pub fn cluster_keys(&self) -> &[PublicKey] {
        &self.cluster_keys
    }

    #[must_use]
    pub const fn listeners(&self) -> &ResultListeners {
        &self.listeners
    }

    #[must_use]
    pub const fn nonces(&self) -> &NonceRegistry {
        &self.nonces
    }

    /// Encrypts `elements` for `computation` under a fresh random nonce
    ///
    /// # Errors
    ///
    /// See [`ConfidentialClient::prepare_with_nonce`]
    pub fn prepare(
        &self,
        computation: &str,
        elements: &[PlaintextElement],
    ) -> Result<PreparedRequest> {
        self.prepare_with_nonce(computation, elements, Nonce::random())
    }

    /// Encrypts `elements` for `computation` under `nonce`.
    ///
    /// Without a session key a fresh key pair is generated for the request.
    /// With one, the nonce is checked against every nonce already used with
    /// that key.
    ///
    /// # Errors
    ///
    /// Returns `ConfidentialClientError::NonceReuse` if `nonce` was already
    /// used with the session key, or a key exchange or encryption error
    #[instrument(level = "debug", skip_all, fields(computation = %computation))]
    pub fn prepare_with_nonce(
        &self,
        computation: &str,
        elements: &[PlaintextElement],
        nonce: Nonce,
    ) -> Result<PreparedRequest> {
        let ephemeral;
        let keypair = match &self.session_key {
            Some(keypair) => keypair,
            None => {
                ephemeral = X25519KeyPair::generate();
                &ephemeral
            }
        };
        let public_key = keypair.public_key();
        let cipher = keypair.shared_secret(&self.cluster_keys)?.cipher()?;
        let request = build_request(&cipher, elements, nonce, &public_key, computation)?;
        if self.session_key.is_some() {
            self.nonces
                .register(&public_key, nonce, request.computation_offset)?;
        }
        tracing::debug!(
            target = "shroud-confidential",
            event = "request_prepared",
            computation_offset = request.computation_offset,
            ciphertexts = request.ciphertexts.len(),
            "Prepared confidential request"
        );
        Ok(PreparedRequest {
            request,
            cipher,
            state: RequestState::Built,
        })
    }

    /// Submits `prepared` and waits for the event named `event_name` that
    /// carries its computation offset.
    ///
    /// The subscription is registered before submission, so a result that
    /// arrives immediately is not missed, and it is released on every exit
    /// path.
    ///
    /// # Errors
    ///
    /// Returns `ConfidentialClientError::Submission` if the transport fails
    /// and `SubscriberError::ChannelTimeout` if no result arrives in time.
    /// Either way `prepared` ends in a terminal state (`Failed` or
    /// `TimedOut`) and cannot be submitted again.
    #[instrument(
        level = "info",
        skip_all,
        fields(
            computation = %prepared.request.computation,
            computation_offset = prepared.request.computation_offset
        )
    )]
    pub async fn submit<S: ComputationSubmitter>(
        &self,
        submitter: &S,
        prepared: &mut PreparedRequest,
        event_name: &str,
    ) -> Result<ResultEvent> {
        let channel = ChannelKey::for_computation(event_name, prepared.request.computation_offset);
        let subscription = self.listeners.subscribe(channel);

        prepared.advance(RequestState::Submitted)?;
        if let Err(e) = submitter.submit(&prepared.request).await {
            prepared.advance(RequestState::Failed)?;
            tracing::error!(
                target = "shroud-confidential",
                event = "request_submission_failed",
                error = %e,
                "Failed to submit confidential request"
            );
            return Err(ConfidentialClientError::Submission(Box::new(e)));
        }
        tracing::trace!(
            target = "shroud-confidential",
            event = "request_submitted",
            "Submitted confidential request"
        );

        match subscription.recv_timeout(self.result_timeout).await {
            Ok(event) => {
                prepared.advance(RequestState::ResultReceived)?;
                Ok(event)
            }
            Err(e @ SubscriberError::ChannelTimeout { .. }) => {
                prepared.advance(RequestState::TimedOut)?;
                tracing::warn!(
                    target = "shroud-confidential",
                    event = "result_timeout",
                    error = %e,
                    "Timed out waiting for computation result"
                );
                Err(e.into())
            }
            Err(e) => {
                prepared.advance(RequestState::Failed)?;
                Err(e.into())
            }
        }
    }

    /// Runs the full lifecycle of a request whose result comes back to the
    /// sender: submit, await, decrypt
    ///
    /// # Errors
    ///
    /// See [`ConfidentialClient::submit`] and [`PreparedRequest::decrypt`]
    pub async fn execute<S: ComputationSubmitter>(
        &self,
        submitter: &S,
        mut prepared: PreparedRequest,
        event_name: &str,
    ) -> Result<DecryptedResult> {
        let event = self.submit(submitter, &mut prepared, event_name).await?;
        prepared.decrypt(event)
    }

    /// Decrypts a result re-encrypted to `keypair`, such as a record receiver
    /// or an observer, using the configured cluster keys
    ///
    /// # Errors
    ///
    /// See [`open_result`]
    pub fn open_result(
        &self,
        keypair: &X25519KeyPair,
        fallback_nonce: Option<Nonce>,
        event: ResultEvent,
    ) -> Result<DecryptedResult> {
        open_result(keypair, &self.cluster_keys, fallback_nonce, event)
    }
}

/// Decrypts a result re-encrypted to `keypair`.
///
/// `fallback_nonce` is the nonce the recipient supplied with the request; it
/// is used only when the event does not announce one.
///
/// # Errors
///
/// Fails on key exchange errors, and as [`decrypt_event`] does
pub fn open_result(
    keypair: &X25519KeyPair,
    cluster_keys: &[PublicKey],
    fallback_nonce: Option<Nonce>,
    event: ResultEvent,
) -> Result<DecryptedResult> {
    let cipher = keypair.shared_secret(cluster_keys)?.cipher()?;
    decrypt_event(&cipher, fallback_nonce, event)
}

/// Decrypts the payload of `event` with `cipher`.
///
/// # Errors
///
/// Returns `ConfidentialClientError::MissingNonce` if neither the event nor
/// the caller provides a nonce, and
/// `ConfidentialClientError::ComputationAborted` for aborted computations
pub fn decrypt_event(
    cipher: &Cipher,
    fallback_nonce: Option<Nonce>,
    event: ResultEvent,
) -> Result<DecryptedResult> {
    let ResultEvent {
        event_name,
        computation_offset,
        payload,
    } = event;
    match payload {
        ResultPayload::Encrypted {
            encryption_key,
            nonce,
            ciphertexts,
        } => {
            let nonce = nonce
                .or(fallback_nonce)
                .ok_or_else(|| ConfidentialClientError::MissingNonce {
                    event_name: event_name.clone(),
                })?;
            let values = cipher.decrypt(&ciphertexts, &nonce)?;
            Ok(DecryptedResult {
                event_name,
                computation_offset,
                encryption_key,
                nonce: Some(nonce),
                values,
                revealed: serde_json::Map::new(),
            })
        }
        ResultPayload::Revealed { fields } => Ok(DecryptedResult {
            event_name,
            computation_offset,
            encryption_key: None,
            nonce: None,
            values: Vec::new(),
            revealed: fields,
        }),
        ResultPayload::Aborted { reason } => {
            Err(ConfidentialClientError::ComputationAborted { event_name, reason })
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfidentialClientError {
    #[error("Key management error: {0}")]
    KeyManagement(#[from] KeyManagementError),
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),
    #[error("Result channel error: {0}")]
    Subscriber(#[from] SubscriberError),
    #[error("Failed to submit request: {0}")]
    Submission(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Nonce {nonce} was already used by computation {computation_offset}")]
    NonceReuse { nonce: u128, computation_offset: u64 },
    #[error("Result `{event_name}` carries no nonce and none was supplied")]
    MissingNonce { event_name: String },
    #[error("Computation for `{event_name}` aborted: {reason}")]
    ComputationAborted { event_name: String, reason: String },
    #[error("Result `{event_name}` is encrypted to another recipient")]
    ForeignRecipient { event_name: String },
}

impl ConfidentialClientError {
    /// Returns true if the request timed out; such requests may be retried
    /// with a newly prepared request
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Subscriber(SubscriberError::ChannelTimeout { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterKeys;

    #[derive(Debug, Error)]
    #[error("transport unavailable")]
    struct TransportDown;

    struct RejectingSubmitter;

    impl ComputationSubmitter for RejectingSubmitter {
        type Error = TransportDown;

        async fn submit(&self, _request: &ComputationRequest) -> std::result::Result<(), Self::Error> {
            Err(TransportDown)
        }
    }

    /// Accepts the request, then drops every pending registration as a
    /// dispatcher shutting down would
    struct ClosingSubmitter {
        listeners: ResultListeners,
    }

    impl ComputationSubmitter for ClosingSubmitter {
        type Error = TransportDown;

        async fn submit(&self, _request: &ComputationRequest) -> std::result::Result<(), Self::Error> {
            self.listeners.clear();
            Ok(())
        }
    }

    fn client(cluster: &ClusterKeys) -> ConfidentialClient {
        ConfidentialClient::new(
            cluster.public_keys(),
            ResultListeners::new(),
            Duration::from_millis(50),
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_empty_cluster() {
        assert!(matches!(
            ConfidentialClient::new(Vec::new(), ResultListeners::new(), Duration::from_secs(1)),
            Err(ConfidentialClientError::KeyManagement(
                KeyManagementError::EmptyPeerSet
            ))
        ));
    }

    #[test]
    fn test_ephemeral_keys_per_request() {
        let cluster = ClusterKeys::generate(2).unwrap();
        let client = client(&cluster);
        let a = client.prepare("flip", &[]).unwrap();
        let b = client.prepare("flip", &[]).unwrap();
        assert_ne!(a.request().sender_public_key, b.request().sender_public_key);
        assert_ne!(a.request().nonce, b.request().nonce);
        assert!(client.nonces().is_empty());
    }

    #[test]
    fn test_session_key_rejects_nonce_reuse() {
        let cluster = ClusterKeys::generate(1).unwrap();
        let mut client = client(&cluster).with_session_key(X25519KeyPair::generate());
        let nonce = Nonce::from_u128(99);

        let first = client.prepare_with_nonce("vote", &[], nonce).unwrap();
        let reused = client.prepare_with_nonce("vote", &[], nonce);
        match reused {
            Err(ConfidentialClientError::NonceReuse {
                nonce: n,
                computation_offset,
            }) => {
                assert_eq!(n, 99);
                assert_eq!(computation_offset, first.request().computation_offset);
            }
            other => panic!("expected nonce reuse, got {other:?}"),
        }

        client.rotate_session_key();
        assert!(client.nonces().is_empty());
        assert!(client.prepare_with_nonce("vote", &[], nonce).is_ok());
    }

    #[test]
    fn test_decrypt_rejects_foreign_recipient() {
        let cluster = ClusterKeys::generate(1).unwrap();
        let client = client(&cluster);
        let receiver = X25519KeyPair::generate();
        let prepared = client
            .prepare("share_patient_data", &[PlaintextElement::from(1u8)])
            .unwrap()
            .with_recipient(&receiver.public_key(), Nonce::random());
        let event = cluster
            .seal_result(prepared.request(), "receivedPatientDataEvent", &[PlaintextElement::from(1u8)])
            .unwrap();
        assert!(matches!(
            prepared.decrypt(event),
            Err(ConfidentialClientError::ForeignRecipient { .. })
        ));
    }

    #[test]
    fn test_decrypt_event_needs_a_nonce() {
        let cipher = Cipher::new(&[1; 32]).unwrap();
        let event = ResultEvent {
            event_name: "sealedEvent".to_string(),
            computation_offset: None,
            payload: ResultPayload::Encrypted {
                encryption_key: None,
                nonce: None,
                ciphertexts: Vec::new(),
            },
        };
        assert!(matches!(
            decrypt_event(&cipher, None, event),
            Err(ConfidentialClientError::MissingNonce { .. })
        ));
    }

    #[test]
    fn test_decrypt_event_aborted_and_revealed() {
        let cipher = Cipher::new(&[1; 32]).unwrap();
        let aborted = ResultEvent {
            event_name: "flipEvent".to_string(),
            computation_offset: Some(1),
            payload: ResultPayload::Aborted {
                reason: "cluster unavailable".to_string(),
            },
        };
        assert!(matches!(
            decrypt_event(&cipher, None, aborted),
            Err(ConfidentialClientError::ComputationAborted { .. })
        ));

        let mut fields = serde_json::Map::new();
        fields.insert("winner".to_string(), serde_json::json!(1));
        let revealed = ResultEvent {
            event_name: "revealResultEvent".to_string(),
            computation_offset: Some(2),
            payload: ResultPayload::Revealed { fields },
        };
        let result = decrypt_event(&cipher, None, revealed).unwrap();
        assert!(result.values.is_empty());
        assert_eq!(result.revealed["winner"], serde_json::json!(1));
    }

    #[test]
    fn test_from_config_keeps_fold_order_and_session_key() {
        let cluster = ClusterKeys::generate(3).unwrap();
        let config = ShroudConfidentialConfig::new(cluster.public_keys_hex(), true);
        let client = ConfidentialClient::from_config(
            &config,
            &ShroudEventsConfig::default(),
            ResultListeners::new(),
        )
        .unwrap();
        assert_eq!(client.cluster_keys(), cluster.public_keys().as_slice());
        assert!(client.session_public_key().is_some());

        let elements = [PlaintextElement::from(7u64), PlaintextElement::from(false)];
        let nonce = Nonce::from_u128(3);
        let prepared = client.prepare_with_nonce("vote", &elements, nonce).unwrap();
        assert_eq!(
            Some(PublicKey::from(prepared.request().sender_public_key)),
            client.session_public_key()
        );
        assert_eq!(cluster.open_request(prepared.request()).unwrap(), elements);
        assert!(matches!(
            client.prepare_with_nonce("vote", &elements, nonce),
            Err(ConfidentialClientError::NonceReuse { .. })
        ));

        let mut reversed = cluster.public_keys_hex();
        reversed.reverse();
        let misordered = ConfidentialClient::from_config(
            &ShroudConfidentialConfig::new(reversed, false),
            &ShroudEventsConfig::default(),
            ResultListeners::new(),
        )
        .unwrap();
        assert!(misordered.session_public_key().is_none());
        let prepared = misordered.prepare("vote", &elements).unwrap();
        assert_ne!(cluster.open_request(prepared.request()).unwrap(), elements);
    }

    #[test]
    fn test_from_config_rejects_missing_keys() {
        assert!(matches!(
            ConfidentialClient::from_config(
                &ShroudConfidentialConfig::default(),
                &ShroudEventsConfig::default(),
                ResultListeners::new(),
            ),
            Err(ConfidentialClientError::KeyManagement(
                KeyManagementError::EmptyPeerSet
            ))
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_marks_request_failed() {
        let cluster = ClusterKeys::generate(1).unwrap();
        let client = client(&cluster);
        let mut prepared = client.prepare("flip", &[PlaintextElement::from(1u8)]).unwrap();

        let err = client
            .submit(&RejectingSubmitter, &mut prepared, "flipEvent")
            .await
            .unwrap_err();
        assert!(matches!(err, ConfidentialClientError::Submission(_)));
        assert!(!err.is_timeout());
        assert_eq!(prepared.state(), RequestState::Failed);
        assert!(client.listeners().is_empty());

        assert!(matches!(
            client
                .submit(&RejectingSubmitter, &mut prepared, "flipEvent")
                .await,
            Err(ConfidentialClientError::Envelope(
                EnvelopeError::InvalidTransition { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_closed_channel_marks_request_failed() {
        let cluster = ClusterKeys::generate(1).unwrap();
        let client = client(&cluster);
        let submitter = ClosingSubmitter {
            listeners: client.listeners().clone(),
        };
        let mut prepared = client.prepare("flip", &[PlaintextElement::from(1u8)]).unwrap();

        let err = client
            .submit(&submitter, &mut prepared, "flipEvent")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConfidentialClientError::Subscriber(SubscriberError::ChannelClosed { .. })
        ));
        assert_eq!(prepared.state(), RequestState::Failed);
    }
}
