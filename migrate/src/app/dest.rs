// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resolution of the destination handshake descriptor.
//!
//! A migration caller hands us an opaque string map produced by the
//! destination cluster: service URLs, a bearer session handle, and the
//! destination host reference.  This module parses it, classifies the
//! destination as intra- or cross-cluster, and applies URL transport
//! policy.  Resolution has no side effects on the database.

use crate::db::Datastore;
use apiary_common::api::{Error, HostRef};
use http::Uri;
use std::collections::BTreeMap;

pub const KEY_MASTER: &str = "master";
pub const KEY_XENOPS: &str = "xenops";
pub const KEY_SM: &str = "SM";
pub const KEY_HOST: &str = "host";
pub const KEY_SESSION: &str = "session_id";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DestinationKind {
    IntraCluster,
    /// The bootstrap RPC to a foreign cluster runs without certificate
    /// verification: we have no trust anchor for it yet.
    CrossCluster { verify_cert: bool },
}

/// A fully resolved destination descriptor.
#[derive(Clone, Debug)]
pub struct Destination {
    pub master_url: Uri,
    pub xenops_url: Uri,
    pub sm_url: Uri,
    pub session: String,
    pub host: HostRef,
    pub remote_ip: String,
    pub remote_master_ip: String,
    pub kind: DestinationKind,
}

impl Destination {
    pub fn is_intra_cluster(&self) -> bool {
        self.kind == DestinationKind::IntraCluster
    }
}

fn required<'a>(
    dest: &'a BTreeMap<String, String>,
    key: &str,
) -> Result<&'a str, Error> {
    dest.get(key).map(String::as_str).ok_or_else(|| {
        Error::invalid_value(key, "missing from destination descriptor")
    })
}

fn parse_url(key: &str, value: &str) -> Result<(Uri, String), Error> {
    let uri: Uri = value
        .parse()
        .map_err(|_| Error::invalid_value(key, format!("bad URL {:?}", value)))?;
    let host = uri
        .host()
        .ok_or_else(|| {
            Error::invalid_value(key, format!("URL {:?} has no host", value))
        })?
        .to_owned();
    Ok((uri, host))
}

fn with_scheme(uri: &Uri, scheme: &str) -> Result<Uri, Error> {
    let mut parts = uri.clone().into_parts();
    parts.scheme = Some(scheme.parse().map_err(|_| {
        Error::internal_error(&format!("bad URI scheme {:?}", scheme))
    })?);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
    }
    Uri::from_parts(parts)
        .map_err(|e| Error::internal_error(&format!("rebuilding URI: {}", e)))
}

/// The descriptor after parsing but before classification and policy.
#[derive(Clone, Debug)]
pub(crate) struct ParsedDescriptor {
    pub master_url: Uri,
    pub xenops_url: Uri,
    pub sm_url: Uri,
    pub session: String,
    pub host: HostRef,
    pub remote_ip: String,
    pub remote_master_ip: String,
}

pub(crate) fn parse(
    dest: &BTreeMap<String, String>,
) -> Result<ParsedDescriptor, Error> {
    let (master_url, remote_master_ip) =
        parse_url(KEY_MASTER, required(dest, KEY_MASTER)?)?;
    let (xenops_url, _) = parse_url(KEY_XENOPS, required(dest, KEY_XENOPS)?)?;
    let (sm_url, remote_ip) = parse_url(KEY_SM, required(dest, KEY_SM)?)?;
    let host = required(dest, KEY_HOST)?
        .parse::<HostRef>()
        .map_err(|_| Error::invalid_value(KEY_HOST, "not a host reference"))?;
    let session = required(dest, KEY_SESSION)?.to_owned();
    Ok(ParsedDescriptor {
        master_url,
        xenops_url,
        sm_url,
        session,
        host,
        remote_ip,
        remote_master_ip,
    })
}

pub(crate) fn apply_policy(
    parsed: ParsedDescriptor,
    intra_cluster: bool,
    tls_forced: bool,
    source_host_address: &str,
) -> Result<Destination, Error> {
    // Storage traffic to ourselves never needs (or supports) TLS: the
    // local storage agent only listens in plaintext on loopback-adjacent
    // paths.
    let sm_url = if parsed.remote_ip == source_host_address {
        with_scheme(&parsed.sm_url, "http")?
    } else {
        parsed.sm_url
    };
    let (master_url, xenops_url) = if tls_forced {
        (
            with_scheme(&parsed.master_url, "https")?,
            with_scheme(&parsed.xenops_url, "https")?,
        )
    } else {
        (parsed.master_url, parsed.xenops_url)
    };
    let kind = if intra_cluster {
        DestinationKind::IntraCluster
    } else {
        DestinationKind::CrossCluster { verify_cert: false }
    };
    Ok(Destination {
        master_url,
        xenops_url,
        sm_url,
        session: parsed.session,
        host: parsed.host,
        remote_ip: parsed.remote_ip,
        remote_master_ip: parsed.remote_master_ip,
        kind,
    })
}

/// Parses and classifies a destination descriptor.
///
/// The destination belongs to this cluster exactly when its host
/// reference resolves in the local database.
pub async fn resolve(
    datastore: &dyn Datastore,
    source_host_address: &str,
    dest: &BTreeMap<String, String>,
) -> Result<Destination, Error> {
    let parsed = parse(dest)?;
    let intra_cluster = datastore.host(&parsed.host).await.is_ok();
    let tls_forced = datastore.pool().await?.tls_verification_enabled;
    apply_policy(parsed, intra_cluster, tls_forced, source_host_address)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(sm: &str) -> BTreeMap<String, String> {
        let host = HostRef::generate();
        [
            (KEY_MASTER, "http://10.0.0.1/jsonrpc"),
            (KEY_XENOPS, "http://10.0.0.2/services/xenops"),
            (KEY_SM, sm),
            (KEY_HOST, &host.to_string()),
            (KEY_SESSION, "OpaqueRef:session"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn rejects_missing_and_malformed_fields() {
        let mut d = descriptor("http://10.0.0.2/services/SM");
        d.remove(KEY_SESSION);
        assert!(matches!(
            parse(&d),
            Err(Error::InvalidValue { label, .. }) if label == KEY_SESSION
        ));

        let mut d = descriptor("http://10.0.0.2/services/SM");
        d.insert(KEY_SM.to_string(), "/no-host-here".to_string());
        assert!(parse(&d).is_err());
    }

    #[test]
    fn sm_url_forced_plaintext_for_source_host() {
        let parsed = parse(&descriptor("https://10.0.0.2/services/SM")).unwrap();
        let dest = apply_policy(parsed, true, false, "10.0.0.2").unwrap();
        assert_eq!(dest.sm_url.scheme_str(), Some("http"));

        // A third-party SM URL is left alone.
        let parsed = parse(&descriptor("https://10.0.0.9/services/SM")).unwrap();
        let dest = apply_policy(parsed, true, false, "10.0.0.2").unwrap();
        assert_eq!(dest.sm_url.scheme_str(), Some("https"));
    }

    #[test]
    fn tls_policy_forces_control_plane_urls() {
        let parsed = parse(&descriptor("http://10.0.0.9/services/SM")).unwrap();
        let dest = apply_policy(parsed, false, true, "10.0.0.2").unwrap();
        assert_eq!(dest.master_url.scheme_str(), Some("https"));
        assert_eq!(dest.xenops_url.scheme_str(), Some("https"));
        assert_eq!(
            dest.kind,
            DestinationKind::CrossCluster { verify_cert: false }
        );
    }
}
