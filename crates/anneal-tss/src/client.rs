//! Ticket authority client
//!
//! The HTTP transport to the ticket authority is a collaborator; this
//! module owns building the per-subsystem requests, sending them through
//! the `TicketAuthority` seam, and sanity-checking the responses.

use std::sync::Arc;

use anneal_core::manifest::BuildIdentity;
use plist::{Dictionary, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::request::{merge_parameters, parameters_from_manifest, TssRequest};
use crate::response;

#[derive(Error, Debug)]
pub enum TssError {
    #[error("ticket authority unreachable: {0}")]
    Authority(String),
    #[error("ticket authority rejected the request: {0}")]
    Rejected(String),
    #[error("device info is missing '{0}'")]
    MissingDeviceInfo(&'static str),
    #[error("could not determine {0} firmware component")]
    NoComponent(&'static str),
}

/// Transport seam to the remote ticket authority.
pub trait TicketAuthority: Send + Sync {
    fn send_request(&self, request: &Dictionary) -> Result<Dictionary, TssError>;
}

/// Inputs to a baseband signing request, lifted from the device's
/// BasebandData request arguments.
#[derive(Debug, Default)]
pub struct BasebandInputs {
    pub ecid: u64,
    pub chip_id: u64,
    pub gold_cert_id: u64,
    pub snum: Option<Vec<u8>>,
    pub nonce: Option<Vec<u8>>,
}

/// High-level ticket client: one method per subsystem.
#[derive(Clone)]
pub struct TicketClient {
    authority: Arc<dyn TicketAuthority>,
}

impl TicketClient {
    pub fn new(authority: Arc<dyn TicketAuthority>) -> Self {
        Self { authority }
    }

    fn send_checked(
        &self,
        request: TssRequest,
        ticket_key: &str,
        subsystem: &str,
    ) -> Result<Dictionary, TssError> {
        info!(subsystem, "Sending ticket authority request");
        let response = self.authority.send_request(&request.into_dictionary())?;
        if response::has_ticket(&response, ticket_key) {
            info!(subsystem, ticket = ticket_key, "Received ticket");
        } else {
            warn!(subsystem, ticket = ticket_key, "No ticket in response, this might not work");
        }
        Ok(response)
    }

    /// AP signing request: the root ticket plus per-component signatures
    /// for the whole build identity.
    pub fn fetch_ap(
        &self,
        identity: &BuildIdentity,
        device_params: &Dictionary,
        image4_supported: bool,
    ) -> Result<Dictionary, TssError> {
        let mut params = Dictionary::new();
        parameters_from_manifest(&mut params, identity);
        merge_parameters(&mut params, device_params);

        let mut request = TssRequest::new();
        request.add_common_tags(&params);
        let ticket_key = if image4_supported {
            request.set("@ApImg4Ticket", Value::Boolean(true));
            "ApImg4Ticket"
        } else {
            request.set("@APTicket", Value::Boolean(true));
            "APTicket"
        };
        self.send_checked(request, ticket_key, "AP")
    }

    /// Baseband signing request (§ baseband packaging).
    pub fn fetch_baseband(
        &self,
        identity: &BuildIdentity,
        inputs: &BasebandInputs,
    ) -> Result<Dictionary, TssError> {
        let mut params = Dictionary::new();
        params.insert("ApECID".into(), Value::Integer(inputs.ecid.into()));
        if let Some(nonce) = &inputs.nonce {
            params.insert("BbNonce".into(), Value::Data(nonce.clone()));
        }
        params.insert("BbChipID".into(), Value::Integer(inputs.chip_id.into()));
        params.insert(
            "BbGoldCertId".into(),
            Value::Integer(inputs.gold_cert_id.into()),
        );
        params.insert(
            "BbSNUM".into(),
            Value::Data(inputs.snum.clone().unwrap_or_default()),
        );
        parameters_from_manifest(&mut params, identity);

        let mut request = TssRequest::new();
        request.add_common_tags(&params);
        request.add_baseband_tags(&params);

        // FDR-capable builds expect a production-fused request.
        if identity.fdr_support() {
            request.set("ApProductionMode", Value::Boolean(true));
            request.set("ApSecurityMode", Value::Boolean(true));
        }

        self.send_checked(request, "BBTicket", "Baseband")
    }

    pub fn fetch_se(
        &self,
        identity: &BuildIdentity,
        device_info: &Dictionary,
    ) -> Result<Dictionary, TssError> {
        let mut params = Dictionary::new();
        parameters_from_manifest(&mut params, identity);
        merge_parameters(&mut params, device_info);

        let mut request = TssRequest::new();
        request.add_common_tags(&params);
        request.add_se_tags(&params);
        self.send_checked(request, "SE,Ticket", "SE")
    }

    /// Savage request; also reports which patch component to upload.
    pub fn fetch_savage(
        &self,
        identity: &BuildIdentity,
        device_info: &Dictionary,
    ) -> Result<(Dictionary, String), TssError> {
        let mut params = Dictionary::new();
        parameters_from_manifest(&mut params, identity);
        merge_parameters(&mut params, device_info);

        let mut request = TssRequest::new();
        request.add_common_tags(&params);
        let comp_name = request
            .add_savage_tags(&params)
            .ok_or(TssError::NoComponent("Savage"))?;
        let response = self.send_checked(request, "Savage,Ticket", "Savage")?;
        Ok((response, comp_name))
    }

    /// Yonkers request; also reports which patch component to upload.
    pub fn fetch_yonkers(
        &self,
        identity: &BuildIdentity,
        device_info: &Dictionary,
    ) -> Result<(Dictionary, String), TssError> {
        let mut params = Dictionary::new();
        parameters_from_manifest(&mut params, identity);
        merge_parameters(&mut params, device_info);

        let mut request = TssRequest::new();
        request.add_common_tags(&params);
        let comp_name = request
            .add_yonkers_tags(&params)
            .ok_or(TssError::NoComponent("Yonkers"))?;
        let response = self.send_checked(request, "Yonkers,Ticket", "Yonkers")?;
        Ok((response, comp_name))
    }

    pub fn fetch_rose(
        &self,
        identity: &BuildIdentity,
        device_info: &Dictionary,
        image4_supported: bool,
    ) -> Result<Dictionary, TssError> {
        let mut params = Dictionary::new();
        parameters_from_manifest(&mut params, identity);
        params.insert("ApProductionMode".into(), Value::Boolean(true));
        if image4_supported {
            params.insert("ApSecurityMode".into(), Value::Boolean(true));
            params.insert("ApSupportsImg4".into(), Value::Boolean(true));
        } else {
            params.insert("ApSupportsImg4".into(), Value::Boolean(false));
        }
        merge_parameters(&mut params, device_info);

        let mut request = TssRequest::new();
        request.add_common_tags(&params);
        request.add_rose_tags(&params);
        self.send_checked(request, "Rap,Ticket", "Rose")
    }

    pub fn fetch_veridian(
        &self,
        identity: &BuildIdentity,
        device_info: &Dictionary,
    ) -> Result<Dictionary, TssError> {
        let mut params = Dictionary::new();
        parameters_from_manifest(&mut params, identity);
        merge_parameters(&mut params, device_info);

        let mut request = TssRequest::new();
        request.add_common_tags(&params);
        request.add_veridian_tags(&params);
        self.send_checked(request, "BMU,Ticket", "Veridian")
    }

    pub fn fetch_tcon(
        &self,
        identity: &BuildIdentity,
        device_info: &Dictionary,
    ) -> Result<Dictionary, TssError> {
        let mut params = Dictionary::new();
        parameters_from_manifest(&mut params, identity);
        merge_parameters(&mut params, device_info);

        let mut request = TssRequest::new();
        request.add_common_tags(&params);
        request.add_tcon_tags(&params);
        self.send_checked(request, "Baobab,Ticket", "Baobab")
    }

    /// Timer request. The device info carries an `InfoArray` whose first
    /// entry names the subsystem tag number; the per-tag parameter names
    /// are interpolated from it. Returns the response, the per-tag ticket
    /// name, and the tag number.
    pub fn fetch_timer(
        &self,
        identity: &BuildIdentity,
        device_info: &Dictionary,
        image4_supported: bool,
    ) -> Result<(Dictionary, String, u32), TssError> {
        let info_dict = device_info
            .get("InfoArray")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_dictionary)
            .ok_or(TssError::MissingDeviceInfo("InfoArray"))?;
        let hwid = info_dict
            .get("HardwareID")
            .and_then(Value::as_dictionary)
            .ok_or(TssError::MissingDeviceInfo("HardwareID"))?;
        let tag = info_dict
            .get("TagNumber")
            .and_then(Value::as_unsigned_integer)
            .ok_or(TssError::MissingDeviceInfo("TagNumber"))? as u32;
        let ticket_name = info_dict
            .get("TicketName")
            .and_then(Value::as_string)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Timer,Ticket,{tag}"));

        let mut params = Dictionary::new();
        parameters_from_manifest(&mut params, identity);
        params.insert("ApProductionMode".into(), Value::Boolean(true));
        if image4_supported {
            params.insert("ApSecurityMode".into(), Value::Boolean(true));
            params.insert("ApSupportsImg4".into(), Value::Boolean(true));
        } else {
            params.insert("ApSupportsImg4".into(), Value::Boolean(false));
        }
        params.insert("TagNumber".into(), Value::Integer(tag.into()));
        params.insert("TicketName".into(), Value::String(ticket_name.clone()));

        let copy_hw = |params: &mut Dictionary, target: String, source: &str| {
            if let Some(value) = hwid.get(source) {
                params.insert(target, value.clone());
            }
        };
        copy_hw(&mut params, format!("Timer,ChipID,{tag}"), "ChipID");
        copy_hw(&mut params, format!("Timer,BoardID,{tag}"), "BoardID");
        copy_hw(&mut params, format!("Timer,ECID,{tag}"), "ECID");
        copy_hw(&mut params, format!("Timer,Nonce,{tag}"), "Nonce");
        copy_hw(&mut params, format!("Timer,SecurityMode,{tag}"), "SecurityMode");
        copy_hw(&mut params, format!("Timer,SecurityDomain,{tag}"), "SecurityDomain");
        copy_hw(&mut params, format!("Timer,ProductionMode,{tag}"), "ProductionStatus");

        let ap_info = device_info
            .get("APInfo")
            .and_then(Value::as_dictionary)
            .ok_or(TssError::MissingDeviceInfo("APInfo"))?;
        merge_parameters(&mut params, ap_info);

        let mut request = TssRequest::new();
        request.add_common_tags(&params);
        request.add_timer_tags(&params, &ticket_name);

        let response = self.send_checked(request, &ticket_name, "Timer")?;
        Ok((response, ticket_name, tag))
    }

    /// Local-policy signing request for the recovery OS.
    pub fn fetch_local_policy(
        &self,
        identity: &BuildIdentity,
        args: Option<&Dictionary>,
    ) -> Result<Dictionary, TssError> {
        let mut params = Dictionary::new();
        parameters_from_manifest(&mut params, identity);
        if let Some(args) = args {
            merge_parameters(&mut params, args);
        }

        let mut request = TssRequest::new();
        request.add_common_tags(&params);
        request.set("@ApImg4Ticket", Value::Boolean(true));
        for (key, value) in &params {
            if key.starts_with("Ap,") {
                request.set(key, value.clone());
            }
        }
        self.send_checked(request, "ApImg4Ticket", "LocalPolicy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockAuthority {
        last_request: Mutex<Option<Dictionary>>,
        response: Dictionary,
    }

    impl MockAuthority {
        fn returning(response: Dictionary) -> Arc<Self> {
            Arc::new(Self {
                last_request: Mutex::new(None),
                response,
            })
        }

        fn request(&self) -> Dictionary {
            self.last_request.lock().unwrap().clone().unwrap()
        }
    }

    impl TicketAuthority for MockAuthority {
        fn send_request(&self, request: &Dictionary) -> Result<Dictionary, TssError> {
            *self.last_request.lock().unwrap() = Some(request.clone());
            Ok(self.response.clone())
        }
    }

    fn identity_with_fdr(fdr: bool) -> BuildIdentity {
        let mut info = Dictionary::new();
        info.insert("FDRSupport".into(), Value::Boolean(fdr));
        let mut dict = Dictionary::new();
        dict.insert("Info".into(), Value::Dictionary(info));
        dict.insert("ApChipID".into(), Value::Integer(0x8010.into()));
        dict.insert("Manifest".into(), Value::Dictionary(Dictionary::new()));
        BuildIdentity::from_dictionary(dict)
    }

    #[test]
    fn test_baseband_request_carries_fdr_modes() {
        let mut response = Dictionary::new();
        response.insert("BBTicket".into(), Value::Data(vec![1]));
        let authority = MockAuthority::returning(response);
        let client = TicketClient::new(authority.clone());

        let inputs = BasebandInputs {
            ecid: 99,
            chip_id: 0x68e0,
            gold_cert_id: 3,
            snum: Some(vec![4; 12]),
            nonce: Some(vec![5; 20]),
        };
        client.fetch_baseband(&identity_with_fdr(true), &inputs).unwrap();

        let sent = authority.request();
        assert_eq!(sent.get("@BBTicket").and_then(Value::as_boolean), Some(true));
        assert_eq!(sent.get("ApProductionMode").and_then(Value::as_boolean), Some(true));
        assert_eq!(sent.get("ApSecurityMode").and_then(Value::as_boolean), Some(true));
        assert!(sent.get("BbNonce").is_some());
        assert!(sent.get("BbSNUM").is_some());
    }

    #[test]
    fn test_baseband_request_without_fdr() {
        let authority = MockAuthority::returning(Dictionary::new());
        let client = TicketClient::new(authority.clone());
        client
            .fetch_baseband(&identity_with_fdr(false), &BasebandInputs::default())
            .unwrap();
        assert!(authority.request().get("ApProductionMode").is_none());
    }

    #[test]
    fn test_timer_request_interpolates_tag() {
        let mut hwid = Dictionary::new();
        hwid.insert("ChipID".into(), Value::Integer(0x1234.into()));
        hwid.insert("ECID".into(), Value::Integer(77.into()));
        hwid.insert("Nonce".into(), Value::Data(vec![1; 16]));
        let mut info0 = Dictionary::new();
        info0.insert("HardwareID".into(), Value::Dictionary(hwid));
        info0.insert("TagNumber".into(), Value::Integer(2.into()));
        info0.insert("TicketName".into(), Value::String("Timer,Ticket,2".into()));
        let mut device_info = Dictionary::new();
        device_info.insert("InfoArray".into(), Value::Array(vec![Value::Dictionary(info0)]));
        device_info.insert("APInfo".into(), Value::Dictionary(Dictionary::new()));

        let authority = MockAuthority::returning(Dictionary::new());
        let client = TicketClient::new(authority.clone());
        let (_, ticket_name, tag) = client
            .fetch_timer(&identity_with_fdr(false), &device_info, true)
            .unwrap();

        assert_eq!(ticket_name, "Timer,Ticket,2");
        assert_eq!(tag, 2);
        let sent = authority.request();
        assert!(sent.get("@Timer,Ticket,2").is_some());
        assert!(sent.get("Timer,ChipID,2").is_some());
        assert!(sent.get("Timer,ECID,2").is_some());
        assert!(sent.get("Timer,Nonce,2").is_some());
    }

    #[test]
    fn test_timer_requires_info_array() {
        let authority = MockAuthority::returning(Dictionary::new());
        let client = TicketClient::new(authority);
        let err = client
            .fetch_timer(&identity_with_fdr(false), &Dictionary::new(), true)
            .unwrap_err();
        assert!(matches!(err, TssError::MissingDeviceInfo("InfoArray")));
    }
}
