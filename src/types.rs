use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Number of fixed columns every search row carries:
/// host, title, ip, domain, port, protocol, server, link.
pub const FIXED_COLUMNS: usize = 8;

/// Fixed field list requested from the API ahead of any additional fields.
pub const FIXED_FIELDS: [&str; FIXED_COLUMNS] = [
    "host", "title", "ip", "domain", "port", "protocol", "server", "link",
];

/// Optional metadata column a query may request on top of the fixed ones.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdditionalField {
    #[serde(rename = "fid")]
    Fid,
    #[serde(rename = "os")]
    Os,
    #[serde(rename = "icp")]
    Icp,
    #[serde(rename = "product")]
    Product,
    #[serde(rename = "certs_subject_cn")]
    CertSubjectCn,
    #[serde(rename = "certs_subject_org")]
    CertSubjectOrg,
    #[serde(rename = "lastupdatetime")]
    LastUpdateTime,
}

impl AdditionalField {
    pub const ALL: [AdditionalField; 7] = [
        AdditionalField::Fid,
        AdditionalField::Os,
        AdditionalField::Icp,
        AdditionalField::Product,
        AdditionalField::CertSubjectCn,
        AdditionalField::CertSubjectOrg,
        AdditionalField::LastUpdateTime,
    ];

    /// Field name as understood by the search API `fields=` parameter.
    pub fn api_name(self) -> &'static str {
        match self {
            AdditionalField::Fid => "fid",
            AdditionalField::Os => "os",
            AdditionalField::Icp => "icp",
            AdditionalField::Product => "product",
            AdditionalField::CertSubjectCn => "certs_subject_cn",
            AdditionalField::CertSubjectOrg => "certs_subject_org",
            AdditionalField::LastUpdateTime => "lastupdatetime",
        }
    }

    /// Column header used in tables and spreadsheets.
    pub fn header(self) -> &'static str {
        match self {
            AdditionalField::Fid => "fid",
            AdditionalField::Os => "OS",
            AdditionalField::Icp => "ICP",
            AdditionalField::Product => "Product",
            AdditionalField::CertSubjectCn => "Cert CN",
            AdditionalField::CertSubjectOrg => "Cert Org",
            AdditionalField::LastUpdateTime => "Last Update",
        }
    }
}

impl fmt::Display for AdditionalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

impl FromStr for AdditionalField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        AdditionalField::ALL
            .into_iter()
            .find(|f| f.api_name() == wanted)
            .or(match wanted.as_str() {
                "cert_cn" | "cert-cn" => Some(AdditionalField::CertSubjectCn),
                "cert_org" | "cert-org" => Some(AdditionalField::CertSubjectOrg),
                "last_update" | "last-update" => Some(AdditionalField::LastUpdateTime),
                _ => None,
            })
            .ok_or_else(|| format!("unknown additional field: {s}"))
    }
}

/// Values of the additional columns; unselected ones stay empty.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Extras {
    pub fid: String,
    pub os: String,
    pub icp: String,
    pub product: String,
    pub cert_subject_cn: String,
    pub cert_subject_org: String,
    pub last_update_time: String,
}

impl Extras {
    pub fn get(&self, field: AdditionalField) -> &str {
        match field {
            AdditionalField::Fid => &self.fid,
            AdditionalField::Os => &self.os,
            AdditionalField::Icp => &self.icp,
            AdditionalField::Product => &self.product,
            AdditionalField::CertSubjectCn => &self.cert_subject_cn,
            AdditionalField::CertSubjectOrg => &self.cert_subject_org,
            AdditionalField::LastUpdateTime => &self.last_update_time,
        }
    }

    pub fn set(&mut self, field: AdditionalField, value: String) {
        let slot = match field {
            AdditionalField::Fid => &mut self.fid,
            AdditionalField::Os => &mut self.os,
            AdditionalField::Icp => &mut self.icp,
            AdditionalField::Product => &mut self.product,
            AdditionalField::CertSubjectCn => &mut self.cert_subject_cn,
            AdditionalField::CertSubjectOrg => &mut self.cert_subject_org,
            AdditionalField::LastUpdateTime => &mut self.last_update_time,
        };
        *slot = value;
    }
}

/// Hash bucket for deduplication. Host is deliberately absent so that
/// `example.com` and `example.com:443` land in the same bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub ip: String,
    pub port: u16,
}

/// One discovered network service as decoded from a search row.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Service {
    pub host: String,
    pub title: String,
    pub ip: String,
    pub domain: String,
    pub port: u16,
    pub protocol: String,
    pub server: String,
    pub link: String,
    #[serde(flatten)]
    pub extras: Extras,
}

impl Service {
    /// Build a service from one raw result row.
    ///
    /// Returns `None` for rows shorter than the fixed column set. Values past
    /// the fixed columns are assigned to `fields` by position; missing ones
    /// stay empty.
    pub fn from_row(row: &[Value], fields: &[AdditionalField]) -> Option<Self> {
        if row.len() < FIXED_COLUMNS {
            return None;
        }
        let mut extras = Extras::default();
        for (i, field) in fields.iter().enumerate() {
            extras.set(*field, coerce_string(row.get(FIXED_COLUMNS + i)));
        }
        Some(Self {
            host: coerce_string(row.first()),
            title: coerce_string(row.get(1)),
            ip: coerce_string(row.get(2)),
            domain: coerce_string(row.get(3)),
            port: coerce_port(row.get(4)),
            protocol: coerce_string(row.get(5)),
            server: coerce_string(row.get(6)),
            link: coerce_string(row.get(7)),
            extras,
        })
    }

    pub fn bucket_key(&self) -> BucketKey {
        BucketKey {
            ip: self.ip.clone(),
            port: self.port,
        }
    }

    /// True when the host names the default port explicitly (`x:443` on 443, `x:80` on 80).
    pub fn has_default_port_suffix(&self) -> bool {
        match self.port {
            443 => self.host.ends_with(":443"),
            80 => self.host.ends_with(":80"),
            _ => false,
        }
    }

    /// Identity predicate: same ip and port, and hosts equal or relaxed by a
    /// default-port suffix on either side.
    pub fn same_entity(&self, other: &Service) -> bool {
        if self.ip != other.ip || self.port != other.port {
            return false;
        }
        self.host == other.host || self.has_default_port_suffix() || other.has_default_port_suffix()
    }

    /// URL used for exports and "open in browser" style consumers.
    pub fn normalized_url(&self) -> String {
        normalize_url(&self.host, &self.protocol, self.port)
    }
}

/// Prefix a scheme unless the host already carries one: `https://` for
/// https or port 443, `http://` otherwise.
pub fn normalize_url(host: &str, protocol: &str, port: u16) -> String {
    if host.starts_with("http") {
        return host.to_string();
    }
    if protocol.eq_ignore_ascii_case("https") || port == 443 {
        format!("https://{host}")
    } else {
        format!("http://{host}")
    }
}

fn coerce_string(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn coerce_port(v: Option<&Value>) -> u16 {
    match v {
        Some(Value::String(s)) => s.trim().parse::<u16>().unwrap_or(0),
        Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()).unwrap_or(0),
        _ => 0,
    }
}

/// Entry shape the aggregator can merge: a service plus an optional display
/// sequence number.
pub trait ServiceEntry: Clone {
    fn from_service(service: Service) -> Self;
    fn service(&self) -> &Service;

    fn sequence(&self) -> Option<u64> {
        None
    }

    fn set_sequence(&mut self, _seq: u64) {}
}

/// Row of the result table. `sequence` is assigned once by the aggregator
/// and survives replacements of the underlying service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub sequence: u64,
    #[serde(flatten)]
    pub service: Service,
}

impl ServiceEntry for Record {
    fn from_service(service: Service) -> Self {
        Self {
            sequence: 0,
            service,
        }
    }

    fn service(&self) -> &Service {
        &self.service
    }

    fn sequence(&self) -> Option<u64> {
        Some(self.sequence)
    }

    fn set_sequence(&mut self, seq: u64) {
        self.sequence = seq;
    }
}

/// Export-mode twin of [`Record`] without a sequence number.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct ExportRecord {
    pub service: Service,
}

impl ServiceEntry for ExportRecord {
    fn from_service(service: Service) -> Self {
        Self { service }
    }

    fn service(&self) -> &Service {
        &self.service
    }
}

impl From<&Record> for ExportRecord {
    fn from(r: &Record) -> Self {
        Self {
            service: r.service.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn svc(ip: &str, port: u16, host: &str) -> Service {
        Service {
            ip: ip.into(),
            port,
            host: host.into(),
            ..Default::default()
        }
    }

    #[test]
    fn port_coercion_defaults_to_zero() {
        let row = vec![
            json!("a.com"),
            Value::Null,
            json!("1.1.1.1"),
            Value::Null,
            json!("not-a-port"),
            json!("http"),
            Value::Null,
            Value::Null,
        ];
        let s = Service::from_row(&row, &[]).unwrap();
        assert_eq!(s.port, 0);
        assert_eq!(s.title, "");
        assert_eq!(s.server, "");

        let mut row2 = row.clone();
        row2[4] = json!(8443);
        assert_eq!(Service::from_row(&row2, &[]).unwrap().port, 8443);
        row2[4] = json!("70000");
        assert_eq!(Service::from_row(&row2, &[]).unwrap().port, 0);
    }

    #[test]
    fn short_row_is_rejected() {
        let row = vec![json!("a"); 7];
        assert!(Service::from_row(&row, &[]).is_none());
    }

    #[test]
    fn extras_map_by_position() {
        let mut row = vec![json!(""); 8];
        row.push(json!("Linux"));
        let fields = [AdditionalField::Os, AdditionalField::Icp];
        let s = Service::from_row(&row, &fields).unwrap();
        assert_eq!(s.extras.os, "Linux");
        assert_eq!(s.extras.icp, "");
    }

    #[test]
    fn suffix_relaxes_host_match_on_default_ports() {
        assert!(svc("1.2.3.4", 443, "1.2.3.4:443").same_entity(&svc("1.2.3.4", 443, "1.2.3.4")));
        assert!(svc("1.2.3.4", 80, "a.com").same_entity(&svc("1.2.3.4", 80, "a.com:80")));
        assert!(!svc("1.2.3.4", 443, "a.com").same_entity(&svc("1.2.3.4", 443, "b.com")));
        assert!(!svc("1.2.3.4", 8080, "a.com:8080").same_entity(&svc("1.2.3.4", 8080, "b.com:8080")));
        assert!(!svc("1.2.3.4", 443, "a.com").same_entity(&svc("1.2.3.5", 443, "a.com")));
    }

    #[test]
    fn normalized_url_schemes() {
        assert_eq!(normalize_url("a.com", "https", 8443), "https://a.com");
        assert_eq!(normalize_url("a.com", "", 443), "https://a.com");
        assert_eq!(normalize_url("a.com:8080", "http", 8080), "http://a.com:8080");
        assert_eq!(normalize_url("https://a.com", "http", 80), "https://a.com");
    }

    #[test]
    fn field_names_parse() {
        assert_eq!("certs_subject_cn".parse::<AdditionalField>(), Ok(AdditionalField::CertSubjectCn));
        assert_eq!("OS".parse::<AdditionalField>(), Ok(AdditionalField::Os));
        assert!("banner".parse::<AdditionalField>().is_err());
    }
}
