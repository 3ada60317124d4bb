mod client;

pub use client::{
    ApiErrorClass, Credentials, DavClient, DavError, Download, MkcolOutcome, ResourceMeta,
};
