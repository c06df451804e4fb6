//! Construction and repair of the SIP messages the Arlo gateway exchanges.
//!
//! The gateway is picky in ways ordinary SIP stacks are not: Via rides a
//! random `.invalid` host over WSS, the From display must be the quoted
//! token `"WebRTC-UDP"`, offers may not carry IPv6 or mDNS candidates, and
//! answers come back without `a=mid`/`a=sendrecv` lines that WebRTC needs.

use rsip::common::uri::param::{Branch, Tag};
use rsip::common::uri::{UriWithParams, UriWithParamsList};
use rsip::headers::{
    Allow, CallId, ContentLength, ContentType, MaxForwards, ProxyAuthorization, Supported,
    ToTypedHeader, UntypedHeader, UserAgent,
};
use rsip::message::headers_ext::HeadersExt;
use rsip::typed;
use rsip::{host_with_port::HostWithPort, Method, Param, Uri, Version};
use tracing::debug;

use crate::config::SipInfo;
use crate::error::{Error, Result};
use crate::util::{gen_branch, is_valid_candidate, rand_string};

const ALLOW_METHODS: &str = "ACK,CANCEL,INVITE,MESSAGE,BYE,OPTIONS,INFO,NOTIFY,REFER";

/// Builds in-dialog requests from the per-call identity.
pub(crate) struct MessageFactory {
    from_uri: Uri,
    to_uri: Uri,
    callee_raw: String,
    device_id: String,
    user_agent: String,
    rand_host: String,
    via_host: HostWithPort,
}

impl MessageFactory {
    pub(crate) fn new(info: &SipInfo) -> Result<Self> {
        let from_uri = Uri::try_from(info.caller_uri.as_str())
            .map_err(|err| Error::configuration(format!("could not parse caller uri: {err}")))?;
        let to_uri = Uri::try_from(info.callee_uri.as_str())
            .map_err(|err| Error::configuration(format!("could not parse callee uri: {err}")))?;

        let rand_host = format!("{}.invalid", rand_string(12));
        let via_host = HostWithPort::try_from(rand_host.as_str())
            .map_err(|err| Error::configuration(format!("could not build via host: {err}")))?;

        Ok(Self {
            from_uri,
            to_uri,
            callee_raw: info.callee_uri.clone(),
            device_id: info.device_id.clone(),
            user_agent: info.user_agent.clone(),
            rand_host,
            via_host,
        })
    }

    pub(crate) fn caller_user(&self) -> String {
        self.from_uri
            .auth
            .as_ref()
            .map(|auth| auth.user.clone())
            .unwrap_or_default()
    }

    pub(crate) fn callee_uri(&self) -> &str {
        &self.callee_raw
    }

    fn via(&self) -> typed::Via {
        typed::Via {
            version: Version::default(),
            transport: rsip::transport::Transport::Wss,
            uri: Uri {
                scheme: None,
                auth: None,
                host_with_port: self.via_host.clone(),
                params: Vec::new(),
                headers: Vec::new(),
            },
            params: vec![Param::Branch(Branch::new(gen_branch()))],
        }
    }

    pub(crate) fn invite(&self, local_sdp: &str) -> rsip::Request {
        let mut headers = rsip::Headers::default();
        headers.unique_push(rsip::Header::Via(self.via().into()));
        headers.unique_push(rsip::Header::MaxForwards(MaxForwards::from(70u32)));
        headers.unique_push(rsip::Header::From(
            typed::From {
                display_name: Some("WebRTC-UDP".into()),
                uri: self.from_uri.clone(),
                params: vec![Param::Tag(Tag::new(rand_string(12)))],
            }
            .into(),
        ));
        headers.unique_push(rsip::Header::To(
            typed::To {
                display_name: None,
                uri: self.to_uri.clone(),
                params: Vec::new(),
            }
            .into(),
        ));
        headers.unique_push(rsip::Header::Contact(rsip::headers::Contact::new(format!(
            "<sip:{}@{};transport=ws;ob>",
            rand_string(8),
            self.rand_host
        ))));
        headers.unique_push(rsip::Header::CallId(CallId::new(rand_string(32))));
        headers.unique_push(rsip::Header::CSeq(
            typed::CSeq {
                seq: 1,
                method: Method::Invite,
            }
            .into(),
        ));
        headers.unique_push(rsip::Header::Allow(Allow::new(ALLOW_METHODS)));
        headers.unique_push(rsip::Header::Supported(Supported::new("outbound")));
        headers.unique_push(rsip::Header::Other(
            "X-extension".into(),
            format!("{}; User-Agent: webrtc", self.device_id),
        ));
        headers.unique_push(rsip::Header::UserAgent(UserAgent::new(
            self.user_agent.clone(),
        )));
        headers.unique_push(rsip::Header::ContentType(ContentType::new(
            "application/sdp",
        )));
        headers.unique_push(rsip::Header::ContentLength(ContentLength::from(
            local_sdp.len() as u32,
        )));

        rsip::Request {
            method: Method::Invite,
            uri: self.to_uri.clone(),
            version: Version::default(),
            headers,
            body: local_sdp.as_bytes().to_vec(),
        }
    }

    /// In-dialog MESSAGE (`startTalk`, `stopTalk`, `keepAlive`).
    pub(crate) fn message(&self, payload: &str) -> rsip::Request {
        let mut headers = rsip::Headers::default();
        headers.unique_push(rsip::Header::Via(self.via().into()));
        headers.unique_push(rsip::Header::MaxForwards(MaxForwards::from(70u32)));
        headers.unique_push(rsip::Header::From(
            typed::From {
                display_name: None,
                uri: self.from_uri.clone(),
                params: vec![Param::Tag(Tag::new(rand_string(12)))],
            }
            .into(),
        ));
        headers.unique_push(rsip::Header::To(
            typed::To {
                display_name: None,
                uri: self.to_uri.clone(),
                params: Vec::new(),
            }
            .into(),
        ));
        headers.unique_push(rsip::Header::CallId(CallId::new(rand_string(32))));
        headers.unique_push(rsip::Header::CSeq(
            typed::CSeq {
                seq: 1,
                method: Method::Message,
            }
            .into(),
        ));
        headers.unique_push(rsip::Header::Supported(Supported::new("outbound")));
        headers.unique_push(rsip::Header::UserAgent(UserAgent::new(
            self.user_agent.clone(),
        )));
        headers.unique_push(rsip::Header::ContentType(ContentType::new("text/plain")));
        headers.unique_push(rsip::Header::ContentLength(ContentLength::from(
            payload.len() as u32,
        )));

        rsip::Request {
            method: Method::Message,
            uri: self.to_uri.clone(),
            version: Version::default(),
            headers,
            body: payload.as_bytes().to_vec(),
        }
    }

    pub(crate) fn ack_for(&self, response: &rsip::Response) -> Result<rsip::Request> {
        self.follow_up(response, Method::Ack, 0)
    }

    /// BYE is the ACK shape with the method swapped and CSeq bumped.
    pub(crate) fn bye_for(&self, response: &rsip::Response) -> Result<rsip::Request> {
        self.follow_up(response, Method::Bye, 1)
    }

    fn follow_up(
        &self,
        response: &rsip::Response,
        method: Method,
        cseq_bump: u32,
    ) -> Result<rsip::Request> {
        let mut via = response
            .via_header()
            .map_err(Error::protocol)?
            .typed()
            .map_err(Error::protocol)?;
        via.params.retain(|param| !matches!(param, Param::Branch(_)));
        via.params.push(Param::Branch(Branch::new(gen_branch())));

        let mut cseq = response
            .cseq_header()
            .map_err(Error::protocol)?
            .typed()
            .map_err(Error::protocol)?;
        cseq.seq += cseq_bump;
        cseq.method = method;

        let mut headers = rsip::Headers::default();
        headers.unique_push(rsip::Header::Via(via.into()));
        if let Some(route) = reversed_record_route(response)? {
            headers.unique_push(route);
        }
        headers.unique_push(rsip::Header::MaxForwards(MaxForwards::from(70u32)));
        headers.unique_push(rsip::Header::From(
            response.from_header().map_err(Error::protocol)?.clone(),
        ));
        headers.unique_push(rsip::Header::To(
            response.to_header().map_err(Error::protocol)?.clone(),
        ));
        headers.unique_push(rsip::Header::CallId(
            response.call_id_header().map_err(Error::protocol)?.clone(),
        ));
        headers.unique_push(rsip::Header::CSeq(cseq.into()));
        headers.unique_push(rsip::Header::Supported(Supported::new("outbound")));
        headers.unique_push(rsip::Header::UserAgent(UserAgent::new(
            self.user_agent.clone(),
        )));
        headers.unique_push(rsip::Header::ContentLength(ContentLength::from(0u32)));

        Ok(rsip::Request {
            method,
            uri: self.to_uri.clone(),
            version: Version::default(),
            headers,
            body: Vec::new(),
        })
    }
}

/// The dialog's route set: Record-Route entries of the 200 OK, reversed.
fn reversed_record_route(response: &rsip::Response) -> Result<Option<rsip::Header>> {
    let mut uris: Vec<UriWithParams> = Vec::new();
    for header in response.headers.iter() {
        if let rsip::Header::RecordRoute(record_route) = header {
            let route = rsip::headers::Route::new(record_route.value().to_string());
            let typed = route.typed().map_err(Error::protocol)?;
            uris.extend(typed.uris().iter().cloned());
        }
    }
    if uris.is_empty() {
        return Ok(None);
    }
    uris.reverse();

    let value = UriWithParamsList::from(uris).to_string();
    Ok(Some(rsip::Header::Route(rsip::headers::Route::new(value))))
}

/// Give the auth challenge the identity parameters the Arlo web client uses.
pub(crate) fn fill_challenge(
    auth: &mut crate::auth::AuthHeader,
    factory: &MessageFactory,
) {
    auth.params.insert("username".into(), factory.caller_user());
    auth.params
        .insert("uri".into(), factory.callee_uri().to_string());
    auth.params.insert("cnonce".into(), rand_string(12));
    auth.params.insert("nc".into(), "00000001".into());
}

pub(crate) fn set_proxy_authorization(request: &mut rsip::Request, value: String) {
    request
        .headers
        .unique_push(rsip::Header::ProxyAuthorization(ProxyAuthorization::new(
            value,
        )));
}

pub(crate) fn refresh_branch(request: &mut rsip::Request) -> Result<()> {
    let mut via = request
        .via_header()
        .map_err(Error::protocol)?
        .typed()
        .map_err(Error::protocol)?;
    via.params.retain(|param| !matches!(param, Param::Branch(_)));
    via.params.push(Param::Branch(Branch::new(gen_branch())));
    request.headers.unique_push(rsip::Header::Via(via.into()));
    Ok(())
}

pub(crate) fn bump_cseq(request: &mut rsip::Request) -> Result<()> {
    let mut cseq = request
        .cseq_header()
        .map_err(Error::protocol)?
        .typed()
        .map_err(Error::protocol)?;
    cseq.seq += 1;
    request.headers.unique_push(rsip::Header::CSeq(cseq.into()));
    Ok(())
}

/// Drop offer candidates the backend rejects (IPv6 and mDNS addresses).
pub(crate) fn filter_candidates(sdp: &str) -> String {
    sdp.split("\r\n")
        .filter(|line| {
            if let Some(value) = line.strip_prefix("a=candidate:") {
                if !is_valid_candidate(value) {
                    debug!(candidate = *line, "filtered out candidate");
                    return false;
                }
            }
            true
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}

/// Answers from the base station omit `a=mid:` and `a=sendrecv`; WebRTC
/// refuses such an SDP, so the missing lines go in right after the m-lines.
pub(crate) fn repair_remote_sdp(sdp: &str) -> String {
    let mut repaired = sdp.to_string();
    if !repaired.contains("a=mid:") {
        repaired = insert_after_media(&repaired, &[("m=audio", "a=mid:0"), ("m=video", "a=mid:1")]);
    }
    if !repaired.contains("a=sendrecv") {
        repaired = insert_after_media(
            &repaired,
            &[("m=audio", "a=sendrecv"), ("m=video", "a=sendrecv")],
        );
    }
    repaired
}

fn insert_after_media(sdp: &str, inserts: &[(&str, &str)]) -> String {
    let mut lines: Vec<String> = sdp.split("\r\n").map(str::to_string).collect();
    for (media_prefix, directive) in inserts {
        if let Some(idx) = lines.iter().position(|line| line.starts_with(media_prefix)) {
            lines.insert(idx + 1, directive.to_string());
        }
    }
    lines.join("\r\n")
}

/// The gateway wants the From display sent as a quoted string; rsip emits
/// the bare token.
pub(crate) fn quote_display(serialized: &str) -> String {
    if serialized.contains("\"WebRTC-UDP\"") {
        return serialized.to_string();
    }
    serialized.replace("WebRTC-UDP", "\"WebRTC-UDP\"")
}
