//! TLS provider backed by the system OpenSSL, resolved at runtime.
//!
//! The whole function table is resolved when the provider is created, so a
//! library missing any symbol is rejected before a single link is accepted.

use std::ffi::{c_char, c_int, c_long, c_ulong, c_void, CString};
use std::io::{self, ErrorKind};
use std::net::TcpStream;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;
use std::sync::{Arc, OnceLock};

use libloading::{Library, Symbol};
use zeroize::Zeroizing;

use super::helper::TlsMaterial;
use super::options::TlsOptions;
use super::provider::{TlsProvider, TlsSession};
use super::TlsError;

type Ptr = *mut c_void;
type VerifyCallback = extern "C" fn(c_int, Ptr) -> c_int;

const SSL_FILETYPE_PEM: c_int = 1;
const SSL_VERIFY_PEER: c_int = 0x01;
const SSL_VERIFY_FAIL_IF_NO_PEER_CERT: c_int = 0x02;
const SSL_CTRL_MODE: c_int = 33;
const SSL_CTRL_SET_MIN_PROTO_VERSION: c_int = 123;
const SSL_CTRL_SET_TLSEXT_HOSTNAME: c_int = 55;
const TLSEXT_NAMETYPE_HOST_NAME: c_long = 0;
const SSL_MODE_ENABLE_PARTIAL_WRITE: c_long = 0x01;
const SSL_MODE_ACCEPT_MOVING_WRITE_BUFFER: c_long = 0x02;
const TLS1_2_VERSION: c_long = 0x0303;
const X509_V_FLAG_CRL_CHECK: c_ulong = 0x04;
const X509_V_FLAG_CRL_CHECK_ALL: c_ulong = 0x08;

const SSL_ERROR_WANT_READ: c_int = 2;
const SSL_ERROR_WANT_WRITE: c_int = 3;
const SSL_ERROR_SYSCALL: c_int = 5;
const SSL_ERROR_ZERO_RETURN: c_int = 6;

/// Resolved libssl/libcrypto entry points.
struct SslSymbols {
    init_ssl: unsafe extern "C" fn(u64, *const c_void) -> c_int,
    tls_method: unsafe extern "C" fn() -> *const c_void,
    ctx_new: unsafe extern "C" fn(*const c_void) -> Ptr,
    ctx_free: unsafe extern "C" fn(Ptr),
    ctx_ctrl: unsafe extern "C" fn(Ptr, c_int, c_long, Ptr) -> c_long,
    ctx_use_chain_file: unsafe extern "C" fn(Ptr, *const c_char) -> c_int,
    ctx_use_key_file: unsafe extern "C" fn(Ptr, *const c_char, c_int) -> c_int,
    ctx_check_key: unsafe extern "C" fn(*const c_void) -> c_int,
    ctx_load_verify: unsafe extern "C" fn(Ptr, *const c_char, *const c_char) -> c_int,
    ctx_set_verify: unsafe extern "C" fn(Ptr, c_int, Option<VerifyCallback>),
    ctx_set_passwd_userdata: unsafe extern "C" fn(Ptr, Ptr),
    ctx_get_cert_store: unsafe extern "C" fn(*const c_void) -> Ptr,
    store_load_locations: unsafe extern "C" fn(Ptr, *const c_char, *const c_char) -> c_int,
    store_set_flags: unsafe extern "C" fn(Ptr, c_ulong) -> c_int,
    store_ctx_get_error: unsafe extern "C" fn(Ptr) -> c_int,
    ssl_new: unsafe extern "C" fn(Ptr) -> Ptr,
    ssl_free: unsafe extern "C" fn(Ptr),
    ssl_set_fd: unsafe extern "C" fn(Ptr, c_int) -> c_int,
    ssl_ctrl: unsafe extern "C" fn(Ptr, c_int, c_long, Ptr) -> c_long,
    ssl_set1_host: unsafe extern "C" fn(Ptr, *const c_char) -> c_int,
    ssl_get0_param: unsafe extern "C" fn(Ptr) -> Ptr,
    param_set1_ip_asc: unsafe extern "C" fn(Ptr, *const c_char) -> c_int,
    ssl_accept: unsafe extern "C" fn(Ptr) -> c_int,
    ssl_connect: unsafe extern "C" fn(Ptr) -> c_int,
    ssl_read: unsafe extern "C" fn(Ptr, Ptr, c_int) -> c_int,
    ssl_write: unsafe extern "C" fn(Ptr, *const c_void, c_int) -> c_int,
    ssl_get_error: unsafe extern "C" fn(*const c_void, c_int) -> c_int,
    ssl_shutdown: unsafe extern "C" fn(Ptr) -> c_int,
    err_get_error: unsafe extern "C" fn() -> c_ulong,
    err_error_string_n: unsafe extern "C" fn(c_ulong, *mut c_char, usize),
    // Keep the libraries mapped for as long as the pointers above live.
    _ssl: Library,
    _crypto: Library,
}

/// Used by the verify callback, which cannot carry state.
static STORE_CTX_GET_ERROR: OnceLock<unsafe extern "C" fn(Ptr) -> c_int> = OnceLock::new();

extern "C" fn verify_callback(preverify_ok: c_int, store_ctx: Ptr) -> c_int {
    if preverify_ok == 0 {
        if let Some(get_error) = STORE_CTX_GET_ERROR.get() {
            // SAFETY: OpenSSL passes a valid X509_STORE_CTX for the duration of the callback.
            let code = unsafe { get_error(store_ctx) };
            tracing::warn!(x509_error = code, "peer certificate verification failed");
        }
    }
    preverify_ok
}

fn resolve<T: Copy>(lib: &Library, name: &str) -> Result<T, TlsError> {
    let mut symbol_name = name.as_bytes().to_vec();
    symbol_name.push(0);
    // SAFETY: every call site names the exact C prototype of the symbol.
    let symbol: Symbol<T> = unsafe { lib.get(&symbol_name) }.map_err(|_| TlsError::MissingSymbol {
        name: name.to_string(),
    })?;
    Ok(*symbol)
}

fn open(path: &str) -> Result<Library, TlsError> {
    // SAFETY: loading libssl/libcrypto runs only their standard initialisers.
    unsafe { Library::new(path) }.map_err(|e| TlsError::LibraryLoad {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

impl SslSymbols {
    fn load(ssl_path: &str, crypto_path: &str) -> Result<Self, TlsError> {
        let crypto = open(crypto_path)?;
        let ssl = open(ssl_path)?;
        Ok(Self {
            init_ssl: resolve(&ssl, "OPENSSL_init_ssl")?,
            tls_method: resolve(&ssl, "TLS_method")?,
            ctx_new: resolve(&ssl, "SSL_CTX_new")?,
            ctx_free: resolve(&ssl, "SSL_CTX_free")?,
            ctx_ctrl: resolve(&ssl, "SSL_CTX_ctrl")?,
            ctx_use_chain_file: resolve(&ssl, "SSL_CTX_use_certificate_chain_file")?,
            ctx_use_key_file: resolve(&ssl, "SSL_CTX_use_PrivateKey_file")?,
            ctx_check_key: resolve(&ssl, "SSL_CTX_check_private_key")?,
            ctx_load_verify: resolve(&ssl, "SSL_CTX_load_verify_locations")?,
            ctx_set_verify: resolve(&ssl, "SSL_CTX_set_verify")?,
            ctx_set_passwd_userdata: resolve(&ssl, "SSL_CTX_set_default_passwd_cb_userdata")?,
            ctx_get_cert_store: resolve(&ssl, "SSL_CTX_get_cert_store")?,
            store_load_locations: resolve(&crypto, "X509_STORE_load_locations")?,
            store_set_flags: resolve(&crypto, "X509_STORE_set_flags")?,
            store_ctx_get_error: resolve(&crypto, "X509_STORE_CTX_get_error")?,
            ssl_new: resolve(&ssl, "SSL_new")?,
            ssl_free: resolve(&ssl, "SSL_free")?,
            ssl_set_fd: resolve(&ssl, "SSL_set_fd")?,
            ssl_ctrl: resolve(&ssl, "SSL_ctrl")?,
            ssl_set1_host: resolve(&ssl, "SSL_set1_host")?,
            ssl_get0_param: resolve(&ssl, "SSL_get0_param")?,
            param_set1_ip_asc: resolve(&crypto, "X509_VERIFY_PARAM_set1_ip_asc")?,
            ssl_accept: resolve(&ssl, "SSL_accept")?,
            ssl_connect: resolve(&ssl, "SSL_connect")?,
            ssl_read: resolve(&ssl, "SSL_read")?,
            ssl_write: resolve(&ssl, "SSL_write")?,
            ssl_get_error: resolve(&ssl, "SSL_get_error")?,
            ssl_shutdown: resolve(&ssl, "SSL_shutdown")?,
            err_get_error: resolve(&crypto, "ERR_get_error")?,
            err_error_string_n: resolve(&crypto, "ERR_error_string_n")?,
            _ssl: ssl,
            _crypto: crypto,
        })
    }

    /// Drains the OpenSSL error queue into one message.
    fn last_error(&self, context: &str) -> String {
        let mut messages = Vec::new();
        loop {
            // SAFETY: ERR_get_error only reads the thread-local error queue.
            let code = unsafe { (self.err_get_error)() };
            if code == 0 {
                break;
            }
            let mut buf = [0 as c_char; 256];
            // SAFETY: buf is writable for its full length and OpenSSL NUL-terminates it.
            unsafe { (self.err_error_string_n)(code, buf.as_mut_ptr(), buf.len()) };
            let text = buf.iter().take_while(|c| **c != 0).map(|c| *c as u8).collect::<Vec<_>>();
            messages.push(String::from_utf8_lossy(&text).into_owned());
        }
        if messages.is_empty() {
            context.to_string()
        } else {
            format!("{context}: {}", messages.join("; "))
        }
    }
}

fn c_path(path: &Path) -> Result<CString, TlsError> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| TlsError::InvalidPath {
        path: path.to_path_buf(),
        reason: "path contains a NUL byte".to_string(),
    })
}

/// An owned `SSL_CTX`.
struct SslContext {
    symbols: Arc<SslSymbols>,
    ctx: Ptr,
}

// SAFETY: an SSL_CTX is safe to share across threads once configuration is done,
// and it is never reconfigured after construction.
unsafe impl Send for SslContext {}
unsafe impl Sync for SslContext {}

impl Drop for SslContext {
    fn drop(&mut self) {
        // SAFETY: ctx came from SSL_CTX_new and is freed exactly once.
        unsafe { (self.symbols.ctx_free)(self.ctx) };
    }
}

impl SslContext {
    fn build(symbols: &Arc<SslSymbols>, material: &TlsMaterial, passphrase: Option<&Zeroizing<Vec<u8>>>) -> Result<Self, TlsError> {
        let s = symbols.as_ref();
        let fail = |what: &str| TlsError::Provider {
            reason: s.last_error(what),
        };

        // SAFETY: TLS_method returns a static method table.
        let ctx = unsafe { (s.ctx_new)((s.tls_method)()) };
        if ctx.is_null() {
            return Err(fail("SSL_CTX_new failed"));
        }
        let context = Self {
            symbols: symbols.clone(),
            ctx,
        };

        let cert_path = material.cert_path.as_deref().ok_or_else(|| TlsError::Provider {
            reason: "dynamic provider needs a certificate file".to_string(),
        })?;
        let key_path = material.key_path.as_deref().ok_or_else(|| TlsError::Provider {
            reason: "dynamic provider needs a key file".to_string(),
        })?;
        let cert_c = c_path(cert_path)?;
        let key_c = c_path(key_path)?;

        // SAFETY: ctx is a live SSL_CTX; every pointer argument is a valid
        // NUL-terminated string or buffer that outlives the call. The passphrase
        // buffer is owned by DynamicTls and outlives the context.
        unsafe {
            (s.ctx_ctrl)(ctx, SSL_CTRL_SET_MIN_PROTO_VERSION, TLS1_2_VERSION, ptr::null_mut());
            (s.ctx_ctrl)(
                ctx,
                SSL_CTRL_MODE,
                SSL_MODE_ENABLE_PARTIAL_WRITE | SSL_MODE_ACCEPT_MOVING_WRITE_BUFFER,
                ptr::null_mut(),
            );
            if let Some(pass) = passphrase {
                (s.ctx_set_passwd_userdata)(ctx, pass.as_ptr() as Ptr);
            }
            if (s.ctx_use_chain_file)(ctx, cert_c.as_ptr()) != 1 {
                return Err(fail("failed to load certificate chain"));
            }
            if (s.ctx_use_key_file)(ctx, key_c.as_ptr(), SSL_FILETYPE_PEM) != 1 {
                return Err(fail("failed to load private key"));
            }
            if (s.ctx_check_key)(ctx) != 1 {
                return Err(fail("private key does not match certificate"));
            }
            for ca in &material.ca_paths {
                let ca_c = c_path(ca)?;
                if (s.ctx_load_verify)(ctx, ca_c.as_ptr(), ptr::null()) != 1 {
                    return Err(fail("failed to load CA"));
                }
            }
            if !material.crl_paths.is_empty() {
                let store = (s.ctx_get_cert_store)(ctx);
                for crl in &material.crl_paths {
                    let crl_c = c_path(crl)?;
                    if (s.store_load_locations)(store, crl_c.as_ptr(), ptr::null()) != 1 {
                        return Err(fail("failed to load CRL"));
                    }
                }
                (s.store_set_flags)(store, X509_V_FLAG_CRL_CHECK | X509_V_FLAG_CRL_CHECK_ALL);
            }
            (s.ctx_set_verify)(
                ctx,
                SSL_VERIFY_PEER | SSL_VERIFY_FAIL_IF_NO_PEER_CERT,
                Some(verify_callback),
            );
        }
        Ok(context)
    }
}

/// [`TlsProvider`] over a runtime-loaded OpenSSL.
pub struct DynamicTls {
    context: SslContext,
    // Referenced by the SSL_CTX as password callback userdata.
    _passphrase: Option<Zeroizing<Vec<u8>>>,
}

impl std::fmt::Debug for DynamicTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicTls").finish()
    }
}

impl DynamicTls {
    /// Loads the libraries named in `options` and configures a context.
    pub fn new(options: &TlsOptions, material: &TlsMaterial) -> Result<Self, TlsError> {
        let symbols = Arc::new(SslSymbols::load(&options.ssl_library_path, &options.crypto_library_path)?);
        let _ = STORE_CTX_GET_ERROR.set(symbols.store_ctx_get_error);
        // SAFETY: OPENSSL_init_ssl is idempotent and thread-safe.
        if unsafe { (symbols.init_ssl)(0, ptr::null()) } != 1 {
            return Err(TlsError::Provider {
                reason: symbols.last_error("OPENSSL_init_ssl failed"),
            });
        }

        let passphrase = material.passphrase.as_ref().map(|p| {
            let mut bytes = Zeroizing::new(Vec::with_capacity(p.len() + 1));
            bytes.extend_from_slice(p.as_bytes());
            bytes.push(0);
            bytes
        });
        let context = SslContext::build(&symbols, material, passphrase.as_ref())?;
        Ok(Self {
            context,
            _passphrase: passphrase,
        })
    }

    /// `server_name` is `None` on the accepting side; a client checks the
    /// peer certificate against it, as an IP SAN or a DNS name.
    fn session(&self, sock: &TcpStream, server_name: Option<&str>) -> Result<Box<dyn TlsSession>, TlsError> {
        let s = self.context.symbols.clone();
        // SAFETY: the context is live for the lifetime of self.
        let ssl = unsafe { (s.ssl_new)(self.context.ctx) };
        if ssl.is_null() {
            return Err(TlsError::Handshake {
                reason: s.last_error("SSL_new failed"),
            });
        }
        let session = DynamicSession { symbols: s, ssl };
        let s = &session.symbols;
        // SAFETY: ssl is live and the fd stays open while the session exists.
        unsafe {
            if (s.ssl_set_fd)(ssl, sock.as_raw_fd()) != 1 {
                return Err(TlsError::Handshake {
                    reason: s.last_error("SSL_set_fd failed"),
                });
            }
            if let Some(name) = server_name {
                expect_peer_name(s, ssl, name)?;
            }
            let rc = match server_name {
                None => (s.ssl_accept)(ssl),
                Some(_) => (s.ssl_connect)(ssl),
            };
            if rc != 1 {
                let code = (s.ssl_get_error)(ssl, rc);
                return Err(TlsError::Handshake {
                    reason: s.last_error(&format!("handshake error {code}")),
                });
            }
        }
        Ok(Box::new(session))
    }
}

/// Pins hostname or IP verification on a client session and sends SNI for names.
///
/// # Safety
///
/// `ssl` must be a live `SSL` object created from `symbols`.
unsafe fn expect_peer_name(symbols: &SslSymbols, ssl: Ptr, name: &str) -> Result<(), TlsError> {
    let name_c = CString::new(name).map_err(|_| TlsError::Handshake {
        reason: format!("server name {name:?} contains a NUL byte"),
    })?;
    if name.parse::<std::net::IpAddr>().is_ok() {
        let param = (symbols.ssl_get0_param)(ssl);
        if param.is_null() || (symbols.param_set1_ip_asc)(param, name_c.as_ptr()) != 1 {
            return Err(TlsError::Handshake {
                reason: symbols.last_error(&format!("cannot verify peer address {name}")),
            });
        }
        return Ok(());
    }
    if (symbols.ssl_set1_host)(ssl, name_c.as_ptr()) != 1 {
        return Err(TlsError::Handshake {
            reason: symbols.last_error(&format!("cannot verify peer name {name}")),
        });
    }
    // SSL_ctrl copies the name before returning.
    (symbols.ssl_ctrl)(
        ssl,
        SSL_CTRL_SET_TLSEXT_HOSTNAME,
        TLSEXT_NAMETYPE_HOST_NAME,
        name_c.as_ptr() as Ptr,
    );
    Ok(())
}

impl TlsProvider for DynamicTls {
    fn name(&self) -> &'static str {
        "openssl-dynamic"
    }

    fn accept(&self, sock: &TcpStream) -> Result<Box<dyn TlsSession>, TlsError> {
        self.session(sock, None)
    }

    fn connect(&self, sock: &TcpStream, server_name: &str) -> Result<Box<dyn TlsSession>, TlsError> {
        self.session(sock, Some(server_name))
    }
}

struct DynamicSession {
    symbols: Arc<SslSymbols>,
    ssl: Ptr,
}

// SAFETY: an SSL object is used by one thread at a time; the link serialises
// access behind its socket mutex.
unsafe impl Send for DynamicSession {}

impl Drop for DynamicSession {
    fn drop(&mut self) {
        // SAFETY: ssl came from SSL_new and is freed exactly once.
        unsafe { (self.symbols.ssl_free)(self.ssl) };
    }
}

impl DynamicSession {
    fn map_result(&self, rc: c_int) -> io::Result<usize> {
        if rc > 0 {
            return Ok(rc as usize);
        }
        // SAFETY: ssl is live.
        let code = unsafe { (self.symbols.ssl_get_error)(self.ssl, rc) };
        match code {
            SSL_ERROR_WANT_READ | SSL_ERROR_WANT_WRITE => Err(io::Error::from(ErrorKind::WouldBlock)),
            SSL_ERROR_ZERO_RETURN => Ok(0),
            SSL_ERROR_SYSCALL => {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(0) {
                    Ok(0)
                } else {
                    Err(err)
                }
            }
            _ => Err(io::Error::new(
                ErrorKind::InvalidData,
                self.symbols.last_error(&format!("SSL error {code}")),
            )),
        }
    }
}

impl TlsSession for DynamicSession {
    fn read(&mut self, _sock: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(c_int::MAX as usize) as c_int;
        // SAFETY: buf is writable for len bytes.
        let rc = unsafe { (self.symbols.ssl_read)(self.ssl, buf.as_mut_ptr() as Ptr, len) };
        self.map_result(rc)
    }

    fn write(&mut self, _sock: &TcpStream, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(c_int::MAX as usize) as c_int;
        // SAFETY: buf is readable for len bytes.
        let rc = unsafe { (self.symbols.ssl_write)(self.ssl, buf.as_ptr() as *const c_void, len) };
        match self.map_result(rc) {
            Ok(0) => Err(io::Error::from(ErrorKind::BrokenPipe)),
            other => other,
        }
    }

    fn flush_pending(&mut self, _sock: &TcpStream) -> io::Result<bool> {
        // OpenSSL writes records straight to the fd.
        Ok(true)
    }

    fn wants_write(&self) -> bool {
        false
    }

    fn shutdown(&mut self, _sock: &TcpStream) {
        // SAFETY: ssl is live.
        unsafe { (self.symbols.ssl_shutdown)(self.ssl) };
    }
}
