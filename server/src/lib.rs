pub mod cookies;
pub mod errors;
pub mod oidc;
pub mod routes;
pub mod setup;
pub mod state;
