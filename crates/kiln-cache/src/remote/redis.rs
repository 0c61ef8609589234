//! Synchronous key/value backend over the Redis wire protocol.
//!
//! One request/reply exchange per operation. Any I/O error, server error
//! reply or protocol violation tears the connection down; the next use
//! reconnects. Failures never propagate past the facade — the invocation
//! degrades to local-only caching.

use super::resp::{self, Reply};
use super::{remote_key, RemoteCacheProvider};
use crate::compress;
use crate::entry::{CacheEntry, ENTRY_FILE_NAME};
use crate::error::CacheError;
use crate::expected::ExpectedFiles;
use crate::util;
use kiln_config::Config;
use kiln_hash::Digest;
use std::io::{BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

pub struct RedisCacheProvider {
    host: String,
    port: u16,
    connect_timeout: Duration,
    transfer_timeout: Duration,
    compress_level: i32,
    conn: Option<BufReader<TcpStream>>,
}

impl RedisCacheProvider {
    /// `host_description` is the endpoint with the scheme stripped,
    /// e.g. `localhost:6379`.
    pub fn new(host_description: &str, config: &Config) -> Result<Self, CacheError> {
        let (host, port) = host_description
            .rsplit_once(':')
            .ok_or_else(|| CacheError::InvalidEndpoint {
                endpoint: host_description.to_string(),
            })?;
        let port: u16 = port.parse().map_err(|_| CacheError::InvalidEndpoint {
            endpoint: host_description.to_string(),
        })?;
        if host.is_empty() {
            return Err(CacheError::InvalidEndpoint {
                endpoint: host_description.to_string(),
            });
        }

        Ok(Self {
            host: host.to_string(),
            port,
            connect_timeout: config.remote_connect_timeout,
            transfer_timeout: config.remote_transfer_timeout,
            compress_level: config.compress_level,
            conn: None,
        })
    }

    fn disconnect(&mut self) {
        self.conn = None;
    }

    fn exchange(&mut self, command: &[&[u8]]) -> Result<Reply, CacheError> {
        self.connect()?;
        let conn = self.conn.as_mut().ok_or_else(|| CacheError::Remote {
            message: "not connected".to_string(),
        })?;

        let encoded = resp::encode_command(command);
        let result = conn
            .get_mut()
            .write_all(&encoded)
            .and_then(|()| resp::read_reply(conn));

        match result {
            Ok(reply) => Ok(reply),
            Err(err) => {
                self.disconnect();
                Err(CacheError::Remote {
                    message: format!("request failed: {err}"),
                })
            }
        }
    }

    fn get_data(&mut self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match self.exchange(&[b"GET", key.as_bytes()])? {
            Reply::Bulk(data) => {
                tracing::debug!(
                    target = "kiln.remote",
                    key,
                    bytes = data.len(),
                    "downloaded from remote cache"
                );
                Ok(Some(data))
            }
            Reply::Nil => Ok(None),
            Reply::Error(message) => {
                self.disconnect();
                Err(CacheError::Remote {
                    message: format!("reply error: {message}"),
                })
            }
            Reply::Status(_) => {
                self.disconnect();
                Err(CacheError::Remote {
                    message: "unexpected reply type for GET".to_string(),
                })
            }
        }
    }

    fn set_data(&mut self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        match self.exchange(&[b"SET", key.as_bytes(), data])? {
            Reply::Status(_) => {
                tracing::debug!(
                    target = "kiln.remote",
                    key,
                    bytes = data.len(),
                    "uploaded to remote cache"
                );
                Ok(())
            }
            Reply::Error(message) => {
                self.disconnect();
                Err(CacheError::Remote {
                    message: format!("reply error: {message}"),
                })
            }
            Reply::Bulk(_) | Reply::Nil => {
                self.disconnect();
                Err(CacheError::Remote {
                    message: "unexpected reply type for SET".to_string(),
                })
            }
        }
    }
}

impl RemoteCacheProvider for RedisCacheProvider {
    fn connect(&mut self) -> Result<(), CacheError> {
        if self.is_connected() {
            return Ok(());
        }

        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| CacheError::Remote {
                message: format!("failed to resolve {}:{}: {err}", self.host, self.port),
            })?
            .next()
            .ok_or_else(|| CacheError::Remote {
                message: format!("no address for {}:{}", self.host, self.port),
            })?;

        let stream =
            TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(|err| {
                CacheError::Remote {
                    message: format!("failed to connect to {addr}: {err}"),
                }
            })?;
        stream.set_read_timeout(Some(self.transfer_timeout))?;
        stream.set_write_timeout(Some(self.transfer_timeout))?;
        stream.set_nodelay(true)?;

        self.conn = Some(BufReader::new(stream));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn lookup(&mut self, digest: &Digest) -> Result<Option<CacheEntry>, CacheError> {
        let key = remote_key(digest, ENTRY_FILE_NAME);
        let Some(data) = self.get_data(&key)? else {
            return Ok(None);
        };
        match CacheEntry::deserialize(&data) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                tracing::debug!(
                    target = "kiln.remote",
                    digest = %digest,
                    error = %err,
                    "undecodable remote entry, treating as miss"
                );
                Ok(None)
            }
        }
    }

    fn add(
        &mut self,
        digest: &Digest,
        entry: &CacheEntry,
        expected_files: &ExpectedFiles,
    ) -> Result<(), CacheError> {
        for file_id in &entry.file_ids {
            let source = &expected_files
                .get(file_id)
                .ok_or_else(|| CacheError::UnknownFileId {
                    file_id: file_id.clone(),
                })?
                .path;

            let mut data = std::fs::read(source)?;
            if entry.compression_mode.is_compressed() {
                data = compress::compress(&data, self.compress_level)?;
            }
            self.set_data(&remote_key(digest, file_id), &data)?;
        }

        // The descriptor goes last so a reader never sees an entry whose
        // files are still uploading.
        self.set_data(&remote_key(digest, ENTRY_FILE_NAME), &entry.serialize())
    }

    fn get_file(
        &mut self,
        digest: &Digest,
        file_id: &str,
        target_path: &Path,
        compressed: bool,
    ) -> Result<(), CacheError> {
        let key = remote_key(digest, file_id);
        let data = self.get_data(&key)?.ok_or_else(|| CacheError::Remote {
            message: format!("missing remote file {key}"),
        })?;
        let data = if compressed {
            compress::decompress(&data)?
        } else {
            data
        };
        util::atomic_write(target_path, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(desc: &str) -> Result<RedisCacheProvider, CacheError> {
        RedisCacheProvider::new(desc, &Config::default())
    }

    #[test]
    fn parses_host_and_port() {
        let p = provider("cache.example.com:6379").unwrap();
        assert_eq!(p.host, "cache.example.com");
        assert_eq!(p.port, 6379);
        assert!(!p.is_connected());
    }

    #[test]
    fn rejects_malformed_endpoints() {
        assert!(provider("no-port").is_err());
        assert!(provider(":6379").is_err());
        assert!(provider("host:notaport").is_err());
    }
}
