//! Identifier types used by the deployment engine.

use crate::typed_id;

typed_id!(
    /// A deployment: the unit created by one create-deployment request.
    DeploymentId,
    "dep"
);

typed_id!(
    /// One cloud site inside a deployment.
    InfrastructureId,
    "infra"
);

typed_id!(
    /// A credential bundle held in the vault.
    SecretId,
    "sec"
);
