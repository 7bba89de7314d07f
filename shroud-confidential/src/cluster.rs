//! Cluster-side half of the protocol.
//!
//! `ClusterKeys` plays the role of the remote confidential-computation
//! cluster: it owns one X25519 secret per node, in the order clients fold
//! them, and derives the same shared secret a client derives from the node
//! public keys. It opens requests and seals outputs for their recipient,
//! which is what integration tests and local simulations need.

use shroud_events::{ResultEvent, ResultPayload};
use shroud_utils::{CiphertextBlock, Nonce, PlaintextElement};
use tracing::instrument;
use x25519_dalek::PublicKey;

use crate::{
    key_management::{fold_exchanges, KeyManagementError, SharedSecret, X25519KeyPair},
    types::ComputationRequest,
};

type Result<T> = std::result::Result<T, KeyManagementError>;

pub struct ClusterKeys {
    nodes: Vec<X25519KeyPair>,
}

impl ClusterKeys {
    /// Creates a cluster of `node_count` nodes with fresh keys
    ///
    /// # Errors
    ///
    /// Returns `KeyManagementError::EmptyPeerSet` if `node_count` is zero
    pub fn generate(node_count: usize) -> Result<Self> {
        Self::from_nodes((0..node_count).map(|_| X25519KeyPair::generate()).collect())
    }

    /// Wraps existing node key pairs, in fold order
    ///
    /// # Errors
    ///
    /// Returns `KeyManagementError::EmptyPeerSet` if `nodes` is empty
    pub fn from_nodes(nodes: Vec<X25519KeyPair>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(KeyManagementError::EmptyPeerSet);
        }
        Ok(Self { nodes })
    }

    /// Node public keys, in the order clients must fold them
    #[must_use]
    pub fn public_keys(&self) -> Vec<PublicKey> {
        self.nodes.iter().map(X25519KeyPair::public_key).collect()
    }

    /// Hex-encoded node public keys, as they appear in client configuration
    #[must_use]
    pub fn public_keys_hex(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|node| hex::encode(node.public_key().as_bytes()))
            .collect()
    }

    /// Derives the secret shared with the holder of `peer`
    ///
    /// # Errors
    ///
    /// Returns `KeyManagementError::InvalidKey` for a low-order key
    pub fn shared_secret_with(&self, peer: &PublicKey) -> Result<SharedSecret> {
        let exchanges = self
            .nodes
            .iter()
            .map(|node| node.diffie_hellman(peer))
            .collect::<Result<Vec<_>>>()?;
        fold_exchanges(&exchanges)
    }

    /// Decrypts the encrypted inputs of `request`
    ///
    /// # Errors
    ///
    /// Fails if the sender key is invalid or the cipher cannot be keyed
    #[instrument(level = "debug", skip_all, fields(computation = %request.computation))]
    pub fn open_request(&self, request: &ComputationRequest) -> Result<Vec<PlaintextElement>> {
        let sender = PublicKey::from(request.sender_public_key);
        let cipher = self.shared_secret_with(&sender)?.cipher()?;
        Ok(cipher.decrypt(&request.ciphertexts, &request.nonce)?)
    }

    /// Encrypts `elements` for the holder of `recipient` under `nonce`
    ///
    /// # Errors
    ///
    /// Fails if the recipient key is invalid or the cipher cannot be keyed
    pub fn seal_for(
        &self,
        recipient: &PublicKey,
        nonce: &Nonce,
        elements: &[PlaintextElement],
    ) -> Result<Vec<CiphertextBlock>> {
        let cipher = self.shared_secret_with(recipient)?.cipher()?;
        Ok(cipher.encrypt(elements, nonce)?)
    }

    /// Builds the result event for `request` carrying `elements`.
    ///
    /// When the request names a recipient, the output is encrypted to it under
    /// the nonce it supplied and the event carries no nonce. Otherwise the
    /// output goes back to the sender under a fresh nonce announced in the
    /// event, so the request nonce is never used twice.
    ///
    /// # Errors
    ///
    /// Fails if the output key is invalid or the cipher cannot be keyed
    pub fn seal_result(
        &self,
        request: &ComputationRequest,
        event_name: &str,
        elements: &[PlaintextElement],
    ) -> Result<ResultEvent> {
        let (public_key, nonce, announced) = match request.recipient {
            Some(recipient) => (recipient.public_key, recipient.nonce, None),
            None => {
                let fresh = Nonce::random();
                (request.sender_public_key, fresh, Some(fresh))
            }
        };
        let ciphertexts = self.seal_for(&PublicKey::from(public_key), &nonce, elements)?;
        Ok(ResultEvent {
            event_name: event_name.to_string(),
            computation_offset: Some(request.computation_offset),
            payload: ResultPayload::Encrypted {
                encryption_key: Some(public_key),
                nonce: announced,
                ciphertexts,
            },
        })
    }

    /// Builds a result event for an observer that did not send the request,
    /// always under a fresh nonce
    ///
    /// # Errors
    ///
    /// Fails if the observer key is invalid or the cipher cannot be keyed
    pub fn seal_for_observer(
        &self,
        request: &ComputationRequest,
        event_name: &str,
        observer: &PublicKey,
        elements: &[PlaintextElement],
    ) -> Result<ResultEvent> {
        let nonce = Nonce::random();
        let ciphertexts = self.seal_for(observer, &nonce, elements)?;
        Ok(ResultEvent {
            event_name: event_name.to_string(),
            computation_offset: Some(request.computation_offset),
            payload: ResultPayload::Encrypted {
                encryption_key: Some(observer.to_bytes()),
                nonce: Some(nonce),
                ciphertexts,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{envelope::build_request, key_management::derive_shared_secret};

    #[test]
    fn test_cluster_and_client_agree() {
        for node_count in [1, 2, 4] {
            let cluster = ClusterKeys::generate(node_count).unwrap();
            let client = X25519KeyPair::generate();
            let from_client = derive_shared_secret(&client, &cluster.public_keys()).unwrap();
            let from_cluster = cluster.shared_secret_with(&client.public_key()).unwrap();
            assert_eq!(from_client, from_cluster);
        }
    }

    #[test]
    fn test_empty_cluster_rejected() {
        assert!(matches!(
            ClusterKeys::generate(0),
            Err(KeyManagementError::EmptyPeerSet)
        ));
    }

    #[test]
    fn test_open_request() {
        let cluster = ClusterKeys::generate(3).unwrap();
        let client = X25519KeyPair::generate();
        let cipher = derive_shared_secret(&client, &cluster.public_keys())
            .unwrap()
            .cipher()
            .unwrap();
        let elements = vec![PlaintextElement::from(true), PlaintextElement::from(17u64)];
        let request =
            build_request(&cipher, &elements, Nonce::random(), &client.public_key(), "vote")
                .unwrap();
        assert_eq!(cluster.open_request(&request).unwrap(), elements);
    }

    #[test]
    fn test_seal_result_for_sender_uses_fresh_nonce() {
        let cluster = ClusterKeys::generate(1).unwrap();
        let client = X25519KeyPair::generate();
        let cipher = derive_shared_secret(&client, &cluster.public_keys())
            .unwrap()
            .cipher()
            .unwrap();
        let request =
            build_request(&cipher, &[], Nonce::random(), &client.public_key(), "flip").unwrap();
        let event = cluster
            .seal_result(&request, "flipEvent", &[PlaintextElement::from(true)])
            .unwrap();
        match event.payload {
            ResultPayload::Encrypted { nonce, .. } => {
                assert!(nonce.is_some());
                assert_ne!(nonce, Some(request.nonce));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
