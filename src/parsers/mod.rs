//! Format adapters and their lazy dispatch
//!
//! The [`ParserRegistry`] maps extensions to static parser descriptors. The
//! [`ParserLoader`] turns a descriptor into a live [`Parser`] the first time
//! it is needed, probing external dependencies once.

mod archive;
mod error;
mod image;
mod legacy;
mod loader;
mod media;
mod office;
#[cfg(feature = "pdf")]
mod pdf;
pub mod probe;
mod registry;
mod text;
mod traits;
mod types;

pub use archive::{ArchiveLimits, ArchiveParser};
pub use error::{ParseError, ParseResult};
pub use image::ImageParser;
pub use legacy::LegacyOfficeParser;
pub use loader::{
    Availability, LoadedParser, ParserFactories, ParserFactory, ParserLoader, ParserSettings,
    Resolution, UnavailableReason,
};
pub use office::OfficeParser;
#[cfg(feature = "pdf")]
pub use pdf::PdfParser;
pub use registry::{
    normalize_extension, Dependency, DependencyKind, ParserDescriptor, ParserRegistry,
    RegistryError,
};
pub use text::TextParser;
pub use traits::{ParseContext, Parser};
pub use types::{
    doc_type_of, DocumentMetadata, ImageResource, ParseInput, ParsedContent, ParserId,
};
