//! Cuspak - Encrypted Multi-File Container
//!
//! A file format that packs a collection of files into a single container
//! that cannot be opened by standard archive tools and requires the correct
//! secret to recover anything. A slow salted key derivation turns the secret
//! into an AES-256 key; the file manifest is serialized, checksummed, and
//! AEAD-sealed; the payload is laid out by one of two strategies:
//!
//! - **Sequential**: files written back-to-back in manifest order as
//!   independently sealed 1 MiB segment runs.
//! - **Chunked**: files split into fixed-size chunks addressed by a
//!   truncated content hash, deduplicated, and written once in a randomly
//!   shuffled physical order — the payload byte stream reveals no file
//!   boundaries or ordering.
//!
//! Every container ends in a SHA3-256 trailer over all preceding bytes, and
//! every extracted file must pass a whole-file SHA-256 gate before unpack
//! reports it recovered.
//!
//! ## Example
//!
//! ```no_run
//! use cuspak::{pack, unpack, PackOptions, UnpackOptions};
//! use std::path::{Path, PathBuf};
//!
//! // Pack two files
//! let files = vec![PathBuf::from("a.txt"), PathBuf::from("b.bin")];
//! pack(
//!     &files,
//!     Path::new("archive.cpk"),
//!     Some(b"correct-key"),
//!     &PackOptions::default(),
//! ).unwrap();
//!
//! // Unpack them again
//! let recovered = unpack(
//!     Path::new("archive.cpk"),
//!     Path::new("extracted"),
//!     Some(b"correct-key"),
//!     &UnpackOptions::default(),
//! ).unwrap();
//! assert_eq!(recovered.len(), 2);
//! ```

pub mod container;
pub mod error;
pub mod header;
pub mod keys;
pub mod manifest;
pub mod payload;
pub mod progress;
pub mod verify;

pub use container::{inspect, pack, unpack, ContainerInfo, EntryInfo, PackOptions, UnpackOptions};
pub use error::{CuspakError, ErrorKind, Result};
pub use keys::{derive_key, generate_salt, DerivedKey};
pub use manifest::{BlockRef, FileEntry, Manifest, Strategy, FORMAT_VERSION};
pub use progress::{CancelToken, ProgressSink};
