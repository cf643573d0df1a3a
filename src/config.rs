use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig as TlsServerConfig;

/// Server settings, read once from `SPACEBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    /// Startup user name that logs in as the admin actor.
    pub admin_user: String,
    pub max_connections: usize,
    /// WAL appends between background compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "spacebook".into(),
            admin_user: "admin".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> io::Result<T> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            io::Error::new(ErrorKind::InvalidInput, format!("{key}: cannot parse {raw:?}"))
        }),
    }
}

impl ServerConfig {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source; unset keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let d = Self::default();
        let config = Self {
            port: parsed(&lookup, "SPACEBOOK_PORT", d.port)?,
            bind: lookup("SPACEBOOK_BIND").unwrap_or(d.bind),
            data_dir: lookup("SPACEBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("SPACEBOOK_PASSWORD").unwrap_or(d.password),
            admin_user: lookup("SPACEBOOK_ADMIN_USER").unwrap_or(d.admin_user),
            max_connections: parsed(&lookup, "SPACEBOOK_MAX_CONNECTIONS", d.max_connections)?,
            compact_threshold: parsed(&lookup, "SPACEBOOK_COMPACT_THRESHOLD", d.compact_threshold)?,
            metrics_port: match lookup("SPACEBOOK_METRICS_PORT") {
                Some(_) => Some(parsed(&lookup, "SPACEBOOK_METRICS_PORT", 0)?),
                None => None,
            },
            tls_cert: lookup("SPACEBOOK_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("SPACEBOOK_TLS_KEY").map(PathBuf::from),
        };
        if config.tls_cert.is_some() != config.tls_key.is_some() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both SPACEBOOK_TLS_CERT and SPACEBOOK_TLS_KEY must be set, or neither",
            ));
        }
        if config.max_connections == 0 {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "SPACEBOOK_MAX_CONNECTIONS must be at least 1",
            ));
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("spacebook.wal")
    }

    /// Build the TLS acceptor when a certificate and key are configured.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (Some(cert_path), Some(key_path)) = (&self.tls_cert, &self.tls_key) else {
            return Ok(None);
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut tls = TlsServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        tls.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(tls))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> io::Result<ServerConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.wal_path(), PathBuf::from("./data/spacebook.wal"));
        assert!(config.tls_acceptor().unwrap().is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = from_pairs(&[
            ("SPACEBOOK_PORT", "6543"),
            ("SPACEBOOK_ADMIN_USER", "root"),
            ("SPACEBOOK_COMPACT_THRESHOLD", "50"),
            ("SPACEBOOK_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(config.port, 6543);
        assert_eq!(config.admin_user, "root");
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn bad_number_is_an_error() {
        assert!(from_pairs(&[("SPACEBOOK_PORT", "http")]).is_err());
        assert!(from_pairs(&[("SPACEBOOK_MAX_CONNECTIONS", "0")]).is_err());
    }

    #[test]
    fn tls_needs_both_halves() {
        assert!(from_pairs(&[("SPACEBOOK_TLS_CERT", "cert.pem")]).is_err());
        assert!(from_pairs(&[("SPACEBOOK_TLS_KEY", "key.pem")]).is_err());
    }
}
