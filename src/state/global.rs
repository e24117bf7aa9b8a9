//! Cluster-global singletons.

use curator_kv::Compare;
use curator_kv::TxnOp;
use rand::RngCore;
use rand::rngs::OsRng;
use snafu::OptionExt;

use crate::error::CuratorError;
use crate::error::InternalSnafu;
use crate::error::UnavailableSnafu;
use crate::leadership::Leadership;

/// Shared secret nodes present to register.
pub const REGISTER_TICKET_KEY: &str = "/global/register_ticket";
/// Public key of the owner that bootstrapped the cluster.
pub const INITIAL_OWNER_KEY: &str = "/global/initial_owner";

const REGISTER_TICKET_SIZE: usize = 32;

impl Leadership {
    /// The register ticket, generated on first use.
    pub async fn ensure_register_ticket(&self) -> Result<Vec<u8>, CuratorError> {
        let response = self.txn_as_leader([TxnOp::get(REGISTER_TICKET_KEY)]).await?;
        if let Some(kv) = response.kv(0) {
            return Ok(kv.value.clone());
        }

        let mut ticket = vec![0u8; REGISTER_TICKET_SIZE];
        OsRng.fill_bytes(&mut ticket);
        match self
            .txn_as_leader_if([Compare::absent(REGISTER_TICKET_KEY)], [TxnOp::put(REGISTER_TICKET_KEY, ticket.clone())])
            .await
        {
            Ok(_) => Ok(ticket),
            Err(CuratorError::Conflict { .. }) => {
                let response = self.txn_as_leader([TxnOp::get(REGISTER_TICKET_KEY)]).await?;
                let kv = response.kv(0).context(UnavailableSnafu {
                    message: "register ticket vanished after concurrent creation",
                })?;
                Ok(kv.value.clone())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn initial_owner(&self) -> Result<Option<[u8; 32]>, CuratorError> {
        let response = self.txn_as_leader([TxnOp::get(INITIAL_OWNER_KEY)]).await?;
        let Some(kv) = response.kv(0) else {
            return Ok(None);
        };
        let key = <[u8; 32]>::try_from(kv.value.as_slice()).ok().context(InternalSnafu {
            message: format!("initial owner key has invalid length {}", kv.value.len()),
        })?;
        Ok(Some(key))
    }
}
