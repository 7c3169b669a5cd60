//! Ordered header lists with well-known keys (spec §3, §4.2).

use crate::status::{Code, Status};

/// Well-known metadata keys (spec §6). All lowercase, ASCII.
pub mod keys {
    pub const PATH: &str = ":path";
    pub const GRPC_STATUS: &str = "grpc-status";
    pub const GRPC_MESSAGE: &str = "grpc-message";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const GRPC_TIMEOUT: &str = "grpc-timeout";
}

/// Which direction/occasion a [`Metadata`] list was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataFlavor {
    InitialRequest,
    InitialResponse,
    Trailer,
    /// The client's end-of-request-stream marker: a payload-less Metadata
    /// frame with `end_stream=true`, carrying no `grpc-status` (it isn't
    /// the RPC's Trailer, just a direction-close signal). This is the
    /// resolution of spec §9's open question about the sentinel vs.
    /// metadata-with-end-stream duplication: only this exists, never a
    /// separate application-level sentinel value.
    ClientEnd,
}

/// An immutable ordered list of `(name, value)` pairs plus a flavor tag.
///
/// Construction happens once, through the `for_*` helpers; there is no
/// public mutator, matching spec §4.2's "Metadata is immutable once
/// constructed."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    flavor: MetadataFlavor,
    entries: Vec<(String, String)>,
}

impl Metadata {
    /// Construct a raw metadata list directly. Used by transports when
    /// deserializing an on-wire envelope into the core's representation.
    pub fn from_entries(flavor: MetadataFlavor, entries: Vec<(String, String)>) -> Self {
        Metadata { flavor, entries }
    }

    pub fn for_client_initial(path: &str, extras: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut entries = vec![(keys::PATH.to_string(), path.to_string())];
        entries.extend(extras);
        Metadata {
            flavor: MetadataFlavor::InitialRequest,
            entries,
        }
    }

    pub fn for_server_initial_response() -> Self {
        Metadata {
            flavor: MetadataFlavor::InitialResponse,
            entries: Vec::new(),
        }
    }

    pub fn for_trailer(status_code: Code, message: impl Into<String>) -> Self {
        Metadata {
            flavor: MetadataFlavor::Trailer,
            entries: vec![
                (keys::GRPC_STATUS.to_string(), status_code.0.to_string()),
                (keys::GRPC_MESSAGE.to_string(), message.into()),
            ],
        }
    }

    pub fn for_client_end() -> Self {
        Metadata {
            flavor: MetadataFlavor::ClientEnd,
            entries: Vec::new(),
        }
    }

    pub fn flavor(&self) -> MetadataFlavor {
        self.flavor
    }

    /// Returns the first occurrence, matched case-insensitively.
    pub fn get_header_value(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn path(&self) -> Option<&str> {
        self.get_header_value(keys::PATH)
    }

    /// Parse this Trailer's `grpc-status`/`grpc-message` into a [`Status`].
    ///
    /// A Trailer missing `grpc-status` is a protocol error (spec §3); this
    /// only returns `None` in that case so the caller can classify it.
    pub fn status(&self) -> Option<Status> {
        let code = self.get_header_value(keys::GRPC_STATUS)?.parse::<u32>().ok()?;
        let message = self.get_header_value(keys::GRPC_MESSAGE).unwrap_or("").to_string();
        Some(Status::new(Code(code), message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_initial_carries_path() {
        let md = Metadata::for_client_initial("/Echo/Say", std::iter::empty());
        assert_eq!(md.path(), Some("/Echo/Say"));
        assert_eq!(md.flavor(), MetadataFlavor::InitialRequest);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let md = Metadata::from_entries(
            MetadataFlavor::InitialResponse,
            vec![("Content-Type".to_string(), "application/grpc+json".to_string())],
        );
        assert_eq!(md.get_header_value("content-type"), Some("application/grpc+json"));
    }

    #[test]
    fn header_lookup_returns_first_occurrence() {
        let md = Metadata::from_entries(
            MetadataFlavor::InitialResponse,
            vec![
                ("x-trace".to_string(), "first".to_string()),
                ("x-trace".to_string(), "second".to_string()),
            ],
        );
        assert_eq!(md.get_header_value("x-trace"), Some("first"));
    }

    #[test]
    fn trailer_round_trips_status() {
        let md = Metadata::for_trailer(Code::INTERNAL, "boom");
        let status = md.status().unwrap();
        assert_eq!(status.code, Code::INTERNAL);
        assert_eq!(status.message, "boom");
    }

    #[test]
    fn trailer_without_status_header_has_no_status() {
        let md = Metadata::from_entries(MetadataFlavor::Trailer, Vec::new());
        assert!(md.status().is_none());
    }
}
