use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tracing::debug;

use crate::error::{TLS_SETUP, TransportError};

/// 信任锚文件名。
pub const CA_FILE: &str = "ca.crt";

/// TLS 握手中本端扮演的角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

impl HandshakeRole {
    /// 由“是否为客户端”构造角色。
    pub fn from_is_client(is_client: bool) -> Self {
        if is_client { Self::Client } else { Self::Server }
    }
}

/// TLS 证书校验目标与身份材料。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“校验谁、用什么身份、去哪里找密钥”收拢为一个值对象，握手阶段再据此构建
///   `rustls` 配置，调用方不需要接触 `rustls` 的 Builder 链；
///
/// ## 逻辑（How）
/// - `keys_path` 目录下的文件约定：
///   - `<entity_name>.crt`：本端证书链（PEM）；
///   - `<entity_name>.key`：本端私钥（PEM，PKCS#1/PKCS#8/SEC1 均可）；
///   - `ca.crt`：信任锚（PEM，可含多张证书）。
/// - 客户端角色：必须存在 `ca.crt`；若本端证书与私钥同时存在则作为客户端证书出示；
///   以 `verify_host` 校验服务端证书名称。
/// - 服务端角色：必须存在本端证书与私钥；若存在 `ca.crt` 则要求并校验客户端证书。
///
/// ## 契约（What）
/// - 构建失败一律返回分类为 `Configuration` 的 [`TransportError`]；
/// - 加密实现固定为 `ring` provider，协议版本使用 rustls 的安全默认集合。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsParameters {
    verify_host: String,
    keys_path: PathBuf,
    entity_name: String,
}

impl TlsParameters {
    pub fn new(
        verify_host: impl Into<String>,
        keys_path: impl Into<PathBuf>,
        entity_name: impl Into<String>,
    ) -> Self {
        Self {
            verify_host: verify_host.into(),
            keys_path: keys_path.into(),
            entity_name: entity_name.into(),
        }
    }

    pub fn verify_host(&self) -> &str {
        &self.verify_host
    }

    pub fn keys_path(&self) -> &Path {
        &self.keys_path
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    fn certificate_path(&self) -> PathBuf {
        self.keys_path.join(format!("{}.crt", self.entity_name))
    }

    fn key_path(&self) -> PathBuf {
        self.keys_path.join(format!("{}.key", self.entity_name))
    }

    fn ca_path(&self) -> PathBuf {
        self.keys_path.join(CA_FILE)
    }

    /// 校验目标对应的 SNI / 证书名称。
    pub(crate) fn server_name(&self) -> Result<ServerName<'static>, TransportError> {
        ServerName::try_from(self.verify_host.clone()).map_err(|err| {
            TransportError::configuration(
                TLS_SETUP,
                io::Error::new(io::ErrorKind::InvalidInput, err),
            )
        })
    }

    /// 构建客户端角色的 rustls 配置。
    pub(crate) fn client_config(&self) -> Result<ClientConfig, TransportError> {
        let provider = crypto_provider();
        let roots = load_roots(&self.ca_path())?;
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(setup_error)?
            .with_root_certificates(roots);

        let certificate = self.certificate_path();
        let key = self.key_path();
        if certificate.is_file() && key.is_file() {
            debug!(entity = %self.entity_name, "presenting client certificate");
            builder
                .with_client_auth_cert(load_certificates(&certificate)?, load_private_key(&key)?)
                .map_err(setup_error)
        } else {
            Ok(builder.with_no_client_auth())
        }
    }

    /// 构建服务端角色的 rustls 配置。
    pub(crate) fn server_config(&self) -> Result<ServerConfig, TransportError> {
        let provider = crypto_provider();
        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(setup_error)?;

        let ca = self.ca_path();
        let builder = if ca.is_file() {
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(load_roots(&ca)?), provider)
                    .build()
                    .map_err(setup_error)?;
            debug!("requiring client certificates");
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        builder
            .with_single_cert(
                load_certificates(&self.certificate_path())?,
                load_private_key(&self.key_path())?,
            )
            .map_err(setup_error)
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn setup_error<E>(error: E) -> TransportError
where
    E: std::error::Error + Send + Sync + 'static,
{
    TransportError::configuration(TLS_SETUP, io::Error::new(io::ErrorKind::InvalidData, error))
}

fn pem_error(path: &Path, error: rustls_pki_types::pem::Error) -> TransportError {
    let error = match error {
        rustls_pki_types::pem::Error::Io(error) => error,
        other => io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: {other}", path.display()),
        ),
    };
    TransportError::configuration(TLS_SETUP, error)
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let certificates = CertificateDer::pem_file_iter(path)
        .map_err(|err| pem_error(path, err))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| pem_error(path, err))?;
    if certificates.is_empty() {
        return Err(TransportError::configuration(
            TLS_SETUP,
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: no certificates found", path.display()),
            ),
        ));
    }
    Ok(certificates)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    PrivateKeyDer::from_pem_file(path).map_err(|err| pem_error(path, err))
}

fn load_roots(path: &Path) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    for certificate in load_certificates(path)? {
        roots.add(certificate).map_err(setup_error)?;
    }
    Ok(roots)
}
