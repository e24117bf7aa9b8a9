//! Owner credential escrow.
//!
//! The owner that bootstrapped the cluster exchanges its key for a client
//! certificate. The caller proves possession of the key by connecting with
//! a certificate self-signed by it.

use snafu::ResultExt;
use snafu::ensure;
use tracing::info;
use tracing::instrument;

use super::Leader;
use crate::authz::Peer;
use crate::error::CuratorError;
use crate::error::PermissionDeniedSnafu;
use crate::error::PkiSnafu;
use crate::error::Proof;
use crate::error::UnimplementedSnafu;
use crate::identity::OWNER_IDENTITY;
use crate::identity::public_key;
use crate::rpc::EscrowRequest;
use crate::rpc::EscrowResponse;

impl Leader {
    #[instrument(skip_all, fields(identity = %request.requested_identity))]
    pub(super) async fn escrow_owner(&self, peer: &Peer, request: EscrowRequest) -> Result<EscrowResponse, CuratorError> {
        ensure!(
            request.requested_identity == OWNER_IDENTITY,
            UnimplementedSnafu {
                message: format!("escrow is only supported for identity '{OWNER_IDENTITY}'"),
            }
        );
        let requested = public_key(&request.public_key, "public_key")?;

        let Some(transport_key) = peer.transport_key() else {
            return Err(CuratorError::ProofRequired {
                proofs: vec![Proof::RefreshCertificate],
            });
        };
        ensure!(
            transport_key == requested,
            UnimplementedSnafu {
                message: "escrow with a key other than the connection key is not supported",
            }
        );
        let initial_owner = self.leadership.initial_owner().await?;
        ensure!(
            initial_owner == Some(transport_key),
            PermissionDeniedSnafu {
                message: "key is not the initial owner key",
            }
        );

        let store = self.leadership.store().as_ref();
        let ca_certificate = self.pki.cluster_ca().ensure(store).await.context(PkiSnafu)?;
        let owner_certificate = self.pki.owner_certificate(requested).ensure(store).await.context(PkiSnafu)?;
        info!("issued owner certificate");
        Ok(EscrowResponse {
            owner_certificate,
            ca_certificate,
        })
    }
}

#[cfg(test)]
mod tests {
    use curator_kv::KeyValueStore;
    use curator_pki::verify;

    use super::super::testing::*;
    use super::*;
    use crate::error::Code;
    use crate::state::ClusterConfiguration;
    use crate::state::global::INITIAL_OWNER_KEY;

    const OWNER: [u8; 32] = [0xaa; 32];

    fn request(key: [u8; 32]) -> EscrowRequest {
        EscrowRequest {
            requested_identity: OWNER_IDENTITY.into(),
            public_key: key.to_vec(),
        }
    }

    fn connected(key: [u8; 32]) -> Peer {
        Peer::Unauthenticated {
            transport_key: Some(key),
        }
    }

    #[tokio::test]
    async fn issues_owner_certificate() {
        let f = fixture(ClusterConfiguration::default()).await;
        f.store.put(INITIAL_OWNER_KEY, OWNER.to_vec()).await.unwrap();

        let response = f.leader.escrow_owner(&connected(OWNER), request(OWNER)).await.unwrap();
        verify::verify_signed_by(&response.owner_certificate, &response.ca_certificate).unwrap();
        assert_eq!(verify::public_key(&response.owner_certificate).unwrap(), OWNER);
    }

    #[tokio::test]
    async fn rejects_in_order() {
        let f = fixture(ClusterConfiguration::default()).await;
        f.store.put(INITIAL_OWNER_KEY, OWNER.to_vec()).await.unwrap();

        let wrong_identity = EscrowRequest {
            requested_identity: "admin".into(),
            ..request(OWNER)
        };
        let err = f.leader.escrow_owner(&connected(OWNER), wrong_identity).await.unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);

        let short = EscrowRequest {
            public_key: vec![1u8; 8],
            ..request(OWNER)
        };
        let err = f.leader.escrow_owner(&connected(OWNER), short).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = f
            .leader
            .escrow_owner(&Peer::Unauthenticated { transport_key: None }, request(OWNER))
            .await
            .unwrap_err();
        assert!(matches!(err, CuratorError::ProofRequired { .. }));

        let err = f.leader.escrow_owner(&connected([0xbb; 32]), request(OWNER)).await.unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);

        let err = f.leader.escrow_owner(&connected([0xbb; 32]), request([0xbb; 32])).await.unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
    }
}
