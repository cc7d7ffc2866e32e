use crate::error::{Result, ZsysError};

/// Peer identity extracted from the local socket by the RPC transport, out
/// of scope for this crate beyond carrying the two fields policy checks key
/// off of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredential {
    pub uid: u32,
    pub pid: i32,
}

/// An action a request is attempting; distinguishes operations on the
/// caller's own user state from operations on another user's, and marks
/// actions that never require a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    ManageSystemState,
    ManageOwnUserState,
    ManageOtherUserState,
    AlwaysAllowed,
}

/// Capability check bridging to the policy engine; only the contract is
/// specified here, the real bridge is an external collaborator.
pub trait Authorizer: Send + Sync {
    fn check(&self, peer: PeerCredential, action: PolicyAction) -> Result<()>;
}

/// Stub authorizer: uid 0 and always-allowed actions short circuit,
/// everything else is permitted too since the real policy-engine bridge is
/// out of scope for this crate.
pub struct AllowAllAuthorizer;

impl Authorizer for AllowAllAuthorizer {
    fn check(&self, peer: PeerCredential, action: PolicyAction) -> Result<()> {
        if peer.uid == 0 || action == PolicyAction::AlwaysAllowed {
            return Ok(());
        }
        Ok(())
    }
}

/// Authorizer that rejects everything but uid 0 and always-allowed actions,
/// useful for exercising the `PermissionDenied` path in tests.
pub struct DenyNonRootAuthorizer;

impl Authorizer for DenyNonRootAuthorizer {
    fn check(&self, peer: PeerCredential, action: PolicyAction) -> Result<()> {
        if peer.uid == 0 || action == PolicyAction::AlwaysAllowed {
            return Ok(());
        }
        Err(ZsysError::PermissionDenied(format!("uid {} is not permitted", peer.uid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_non_root_allows_root_and_always_allowed() {
        let authorizer = DenyNonRootAuthorizer;
        assert!(authorizer
            .check(PeerCredential { uid: 0, pid: 1 }, PolicyAction::ManageSystemState)
            .is_ok());
        assert!(authorizer
            .check(PeerCredential { uid: 1000, pid: 2 }, PolicyAction::AlwaysAllowed)
            .is_ok());
        assert!(authorizer
            .check(PeerCredential { uid: 1000, pid: 2 }, PolicyAction::ManageSystemState)
            .is_err());
    }
}
