//! opal: client-side privacy tunnel session engine.
//!
//! The engine provisions and maintains a tunnel session against a
//! blind-signing auth service and an egress service, then drives a
//! datapath collaborator through its lifecycle: connect, switch
//! network, rekey, reattempt on transient failure, stop. Transport
//! datapaths, tunnel fds, HTTP, and OAuth are all interfaces the
//! embedding platform provides; the engine owns the state machines and
//! the cryptographic material lifecycle.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod datapath;
pub mod egress;
pub mod http;
pub mod platform;
pub mod provision;
pub mod reconnector;
pub mod session;
pub mod status;
pub mod telemetry;
pub mod timer;

// Re-export configuration types
pub use config::{ConfigError, DatapathProtocol, EngineConfig, IpGeoLevel};

// Re-export the status taxonomy
pub use status::{Code, Status, StatusDetail};

// Re-export collaborator seams
pub use datapath::{
    BridgeTransformParams, Datapath, DatapathDebugInfo, DatapathNotifier, IkeParams,
    IpsecTransformParams, TransformParams,
};
pub use http::{HttpRequest, HttpResponse, HttpStatus, HttpTransport};
pub use platform::{
    AddressFamily, IpsecConfig, NetworkInfo, NetworkType, OAuthTokenProvider, TunFdData,
    TunnelFd, TunnelIpRange, VpnService,
};

// Re-export session types
pub use session::endpoint::Endpoint;
pub use session::notify::SessionObserver;
pub use session::{MtuState, Session, SessionHandle, SessionState, MAX_DATAPATH_REATTEMPTS};

// Re-export the outer retry loop
pub use reconnector::{
    DisconnectionStatus, EngineObserver, Reconnector, ReconnectorHandle, ReconnectorState,
};

// Re-export supporting pieces
pub use auth::tokens::AuthToken;
pub use crypto::{CryptoError, SessionCrypto};
pub use egress::{EgressParams, ProvisionedDataplane};
pub use telemetry::{SessionDebugInfo, Telemetry, TelemetrySnapshot};
pub use timer::{TimerId, TimerManager};
