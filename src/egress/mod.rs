//! Egress client: dataplane provisioning against the egress service.
//!
//! Builds the add-egress request from the current crypto epoch and one
//! unblinded auth token, and parses the response into [`EgressParams`]
//! (or the IKE variant, which the engine passes through untouched).

use crate::config::EngineConfig;
use crate::datapath::IkeParams;
use crate::http::{HttpRequest, HttpTransport};
use crate::session::endpoint::Endpoint;
use crate::status::Status;
use crate::telemetry::Telemetry;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

/// Provisioned dataplane parameters, replaced atomically on rekey.
#[derive(Clone, Debug)]
pub struct EgressParams {
    /// Server-assigned uplink SPI; doubles as the session id.
    pub uplink_spi: u32,
    /// Client-chosen downlink SPI.
    pub downlink_spi: u32,
    /// Up to one IPv4 and one IPv6 endpoint.
    pub egress_endpoints: Vec<Endpoint>,
    pub egress_public_value: Vec<u8>,
    pub server_nonce: Vec<u8>,
    pub expiry: Option<OffsetDateTime>,
    /// Control-plane sockaddr the dataplane was provisioned against.
    pub control_plane_addr: String,
    /// User-private tunnel ranges in CIDR notation.
    pub user_private_ipv4: Option<String>,
    pub user_private_ipv6: Option<String>,
}

/// Either dataplane variant the egress service can provision.
#[derive(Clone)]
pub enum ProvisionedDataplane {
    Ppn(EgressParams),
    Ike(IkeParams),
}

/// Inputs for one add-egress request. Crypto values are snapshots; the
/// live crypto state never crosses into this module.
pub struct AddEgressParams {
    pub is_rekey: bool,
    /// Token message spent on this request.
    pub unblinded_token: String,
    pub unblinded_token_signature: Vec<u8>,
    pub message_mask: Vec<u8>,
    pub region_token_and_signature: String,
    pub signing_key_version: i64,
    pub public_metadata: Option<crate::auth::metadata::PublicMetadata>,
    pub client_public_value: [u8; 32],
    pub client_nonce: [u8; 16],
    pub rekey_verification_key: [u8; 32],
    /// Signature by the previous epoch's key; present only on rekey.
    pub rekey_signature: Option<Vec<u8>>,
    pub downlink_spi: u32,
    /// Uplink SPI of the epoch being replaced; zero on first request.
    pub previous_uplink_spi: u32,
    pub control_plane_sockaddr: String,
    pub apn_type: String,
    pub dynamic_mtu_enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
struct IpRangeBody {
    #[serde(default)]
    ipv4_range: Option<String>,
    #[serde(default)]
    ipv6_range: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PpnDataplaneResponseBody {
    #[serde(default)]
    user_private_ip: Vec<IpRangeBody>,
    #[serde(default)]
    egress_point_sock_addr: Vec<String>,
    #[serde(default)]
    egress_point_public_value: String,
    #[serde(default)]
    server_nonce: String,
    #[serde(default)]
    uplink_spi: u32,
    #[serde(default)]
    expiry: String,
    #[serde(default)]
    control_plane_addr: String,
}

#[derive(Debug, Default, Deserialize)]
struct IkeResponseBody {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    shared_secret: String,
    #[serde(default)]
    server_address: String,
}

/// Client for the egress service.
pub struct EgressClient {
    config: Arc<EngineConfig>,
    http: Arc<dyn HttpTransport>,
    telemetry: Arc<Telemetry>,
}

impl EgressClient {
    pub fn new(
        config: Arc<EngineConfig>,
        http: Arc<dyn HttpTransport>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            config,
            http,
            telemetry,
        }
    }

    /// Issue the add-egress request and parse the provisioned
    /// dataplane out of the response.
    pub async fn add_egress(
        &self,
        params: &AddEgressParams,
    ) -> Result<ProvisionedDataplane, Status> {
        let body = self.build_body(params);
        let request = HttpRequest::post_json(&self.config.brass_url, body)
            .with_api_key(self.config.api_key.as_deref());

        let request_start = Instant::now();
        let response = self.http.post_json(request).await;
        self.telemetry.record_egress_latency(request_start.elapsed());

        info!(
            code = response.status.code,
            is_rekey = params.is_rekey,
            "Got add-egress response"
        );
        if !response.is_ok() {
            return Err(response.to_status("add egress request"));
        }

        parse_response(&response.parse_json()?, params)
    }

    fn build_body(&self, params: &AddEgressParams) -> serde_json::Value {
        let suite = match self.config.cipher_suite_key_length {
            256 => "AES256_GCM",
            _ => "AES128_GCM",
        };

        let mut ppn = serde_json::json!({
            "client_public_value": BASE64.encode(params.client_public_value),
            "client_nonce": BASE64.encode(params.client_nonce),
            "rekey_verification_key": BASE64.encode(params.rekey_verification_key),
            "downlink_spi": params.downlink_spi,
            "control_plane_sock_addr": params.control_plane_sockaddr,
            "dataplane_protocol": self.config.datapath_protocol.wire_name(),
            "suite": suite,
            "region_code": self.config.region_code,
            "apn_type": params.apn_type,
        });
        if self.config.dynamic_mtu_enabled {
            ppn["dynamic_mtu_enabled"] = serde_json::json!(params.dynamic_mtu_enabled);
        }
        if params.is_rekey {
            if let Some(signature) = &params.rekey_signature {
                ppn["rekey_signature"] = serde_json::json!(BASE64.encode(signature));
            }
            ppn["previous_uplink_spi"] = serde_json::json!(params.previous_uplink_spi);
        }

        let mut body = serde_json::json!({
            "unblinded_token": params.unblinded_token,
            "unblinded_token_signature": BASE64.encode(&params.unblinded_token_signature),
            "region_token_and_signature": params.region_token_and_signature,
            "ppn": ppn,
        });
        if let Some(metadata) = &params.public_metadata {
            body["public_metadata"] = serde_json::json!(metadata);
            body["signing_key_version"] = serde_json::json!(params.signing_key_version);
            body["message_mask"] = serde_json::json!(BASE64.encode(&params.message_mask));
        }
        body
    }
}

fn parse_response(
    json: &serde_json::Value,
    params: &AddEgressParams,
) -> Result<ProvisionedDataplane, Status> {
    if let Some(ike) = json.get("ike") {
        let body: IkeResponseBody = serde_json::from_value(ike.clone())
            .map_err(|e| Status::invalid_argument(format!("bad IKE response: {}", e)))?;
        return Ok(ProvisionedDataplane::Ike(IkeParams {
            client_id: decode_bytes(&body.client_id, "client_id")?,
            shared_secret: decode_bytes(&body.shared_secret, "shared_secret")?,
            server_address: body.server_address,
        }));
    }

    // The dataplane object may arrive wrapped or at the top level.
    let dataplane = json.get("ppn_dataplane").unwrap_or(json);
    let body: PpnDataplaneResponseBody = serde_json::from_value(dataplane.clone())
        .map_err(|e| Status::invalid_argument(format!("bad dataplane response: {}", e)))?;

    if body.uplink_spi == 0 {
        return Err(Status::invalid_argument(
            "dataplane response is missing the uplink SPI",
        ));
    }

    let mut egress_endpoints = Vec::new();
    for sockaddr in &body.egress_point_sock_addr {
        egress_endpoints.push(Endpoint::parse(sockaddr)?);
    }
    if egress_endpoints.is_empty() {
        return Err(Status::invalid_argument(
            "dataplane response has no egress endpoints",
        ));
    }

    let expiry = if body.expiry.is_empty() {
        None
    } else {
        Some(
            OffsetDateTime::parse(&body.expiry, &Rfc3339).map_err(|e| {
                Status::invalid_argument(format!("bad expiry timestamp {:?}: {}", body.expiry, e))
            })?,
        )
    };

    let mut user_private_ipv4 = None;
    let mut user_private_ipv6 = None;
    for range in &body.user_private_ip {
        if let Some(v4) = &range.ipv4_range {
            user_private_ipv4 = Some(v4.clone());
        }
        if let Some(v6) = &range.ipv6_range {
            user_private_ipv6 = Some(v6.clone());
        }
    }

    let control_plane_addr = if body.control_plane_addr.is_empty() {
        params.control_plane_sockaddr.clone()
    } else {
        body.control_plane_addr
    };

    Ok(ProvisionedDataplane::Ppn(EgressParams {
        uplink_spi: body.uplink_spi,
        downlink_spi: params.downlink_spi,
        egress_endpoints,
        egress_public_value: decode_bytes(
            &body.egress_point_public_value,
            "egress_point_public_value",
        )?,
        server_nonce: decode_bytes(&body.server_nonce, "server_nonce")?,
        expiry,
        control_plane_addr,
        user_private_ipv4,
        user_private_ipv6,
    }))
}

fn decode_bytes(encoded: &str, field: &str) -> Result<Vec<u8>, Status> {
    BASE64
        .decode(encoded)
        .map_err(|e| Status::invalid_argument(format!("bad base64 in {}: {}", field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::AddressFamily;

    fn sample_params() -> AddEgressParams {
        AddEgressParams {
            is_rekey: false,
            unblinded_token: "blind:abc".into(),
            unblinded_token_signature: vec![1, 2, 3],
            message_mask: vec![4, 5],
            region_token_and_signature: String::new(),
            signing_key_version: 0,
            public_metadata: None,
            client_public_value: [7u8; 32],
            client_nonce: [8u8; 16],
            rekey_verification_key: [9u8; 32],
            rekey_signature: None,
            downlink_spi: 456,
            previous_uplink_spi: 0,
            control_plane_sockaddr: "192.0.2.1:1849".into(),
            apn_type: "ppn".into(),
            dynamic_mtu_enabled: false,
        }
    }

    fn sample_response() -> serde_json::Value {
        serde_json::json!({
            "user_private_ip": [{
                "ipv4_range": "10.2.2.123/32",
                "ipv6_range": "fec2:0001::3/64",
            }],
            "egress_point_sock_addr": [
                "64.9.240.165:2153",
                "[2604:ca00:f001:4::5]:2153",
            ],
            "egress_point_public_value": "a22j+91TxHtS5qa625KCD5ybsyzPR1wkTDWHV2qSQQc=",
            "server_nonce": "Uzt2lEzyvZYzjLAP3E+dAA==",
            "uplink_spi": 123,
            "expiry": "2020-08-07T01:06:13+00:00",
        })
    }

    #[test]
    fn test_parse_top_level_dataplane() {
        let params = sample_params();
        let dataplane = parse_response(&sample_response(), &params).unwrap();
        let egress = match dataplane {
            ProvisionedDataplane::Ppn(egress) => egress,
            ProvisionedDataplane::Ike(_) => panic!("expected PPN dataplane"),
        };
        assert_eq!(egress.uplink_spi, 123);
        assert_eq!(egress.downlink_spi, 456);
        assert_eq!(egress.egress_endpoints.len(), 2);
        assert_eq!(egress.egress_endpoints[0].family(), AddressFamily::V4);
        assert_eq!(egress.egress_endpoints[1].family(), AddressFamily::V6);
        assert_eq!(egress.server_nonce.len(), 16);
        assert_eq!(egress.egress_public_value.len(), 32);
        assert_eq!(egress.user_private_ipv4.as_deref(), Some("10.2.2.123/32"));
        assert_eq!(egress.user_private_ipv6.as_deref(), Some("fec2:0001::3/64"));
        assert_eq!(egress.expiry.unwrap().year(), 2020);
        assert_eq!(egress.control_plane_addr, "192.0.2.1:1849");
    }

    #[test]
    fn test_parse_wrapped_dataplane() {
        let params = sample_params();
        let wrapped = serde_json::json!({ "ppn_dataplane": sample_response() });
        assert!(parse_response(&wrapped, &params).is_ok());
    }

    #[test]
    fn test_parse_ike_variant() {
        let params = sample_params();
        let json = serde_json::json!({
            "ike": {
                "client_id": BASE64.encode(b"client"),
                "shared_secret": BASE64.encode(b"secret"),
                "server_address": "ike.example:500",
            },
        });
        match parse_response(&json, &params).unwrap() {
            ProvisionedDataplane::Ike(ike) => {
                assert_eq!(ike.client_id, b"client");
                assert_eq!(ike.shared_secret, b"secret");
                assert_eq!(ike.server_address, "ike.example:500");
            }
            ProvisionedDataplane::Ppn(_) => panic!("expected IKE dataplane"),
        }
    }

    #[test]
    fn test_parse_rejects_missing_uplink_spi() {
        let params = sample_params();
        let mut response = sample_response();
        response["uplink_spi"] = serde_json::json!(0);
        assert!(parse_response(&response, &params).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_expiry() {
        let params = sample_params();
        let mut response = sample_response();
        response["expiry"] = serde_json::json!("last tuesday");
        assert!(parse_response(&response, &params).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_endpoint() {
        let params = sample_params();
        let mut response = sample_response();
        response["egress_point_sock_addr"] = serde_json::json!(["nonsense"]);
        assert!(parse_response(&response, &params).is_err());
    }
}
