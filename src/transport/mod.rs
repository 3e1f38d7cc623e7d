pub mod api_client;
pub mod refresh;
pub mod session;

pub use api_client::{ApiClient, HttpTokenRefresher};
pub use refresh::{
    ApiCallError, ClientError, RefreshCoordinator, RefreshFailure, SessionError, TokenRefresher,
};
pub use session::{ClientSession, SessionTokens};
