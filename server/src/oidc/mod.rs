//! Relying-party side of the OpenID Connect authorization code flow.

pub mod authorize;
pub mod claims;
pub mod config;
pub mod discovery;
pub mod error;
pub mod nonce;
pub mod session;
pub mod token;
pub mod verify;

pub use authorize::{build_authorization_url, AuthorizationRequest};
pub use claims::{extract_claims, Audience, Claims};
pub use config::{ClientConfig, IdTokenValidation, TokenEndpointAuthMethod};
pub use discovery::{DiscoveryCache, ProviderMetadata};
pub use error::{OidcError, Result};
pub use nonce::generate_nonce;
pub use session::{ExpiryStatus, Session, SessionManager, SessionRecord};
pub use token::{TokenClient, TokenResponse, TokenSet};
pub use verify::IdTokenVerifier;
