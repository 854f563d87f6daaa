pub mod archive;
pub mod backup_service;
pub mod checksum;
pub mod chunker;
pub mod multipart_upload;
pub mod verified_upload;
