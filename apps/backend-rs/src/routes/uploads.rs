use std::collections::HashMap;

use axum::extract::Multipart;

use crate::{error::AppError, services::storage::guess_mime_type};

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

const ACCEPTED_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/webp",
    "image/heic",
    "application/pdf",
];

#[derive(Debug)]
pub struct UploadedFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Text fields plus the single `file` part of a multipart form.
#[derive(Debug, Default)]
pub struct Upload {
    pub fields: HashMap<String, String>,
    pub file: Option<UploadedFile>,
}

impl Upload {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn require_file(self) -> Result<(HashMap<String, String>, UploadedFile), AppError> {
        let file = self
            .file
            .ok_or_else(|| AppError::BadRequest("Multipart field 'file' is required.".to_string()))?;
        Ok((self.fields, file))
    }
}

fn content_type_for(declared: Option<&str>, file_name: &str) -> String {
    declared
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty() && value != "application/octet-stream")
        .unwrap_or_else(|| guess_mime_type(file_name).to_string())
}

pub fn check_file(file: &UploadedFile) -> Result<(), AppError> {
    if file.bytes.is_empty() {
        return Err(AppError::BadRequest("Uploaded file is empty.".to_string()));
    }
    if file.bytes.len() > MAX_UPLOAD_BYTES {
        return Err(AppError::BadRequest(format!(
            "File too large: {} bytes (max {MAX_UPLOAD_BYTES}).",
            file.bytes.len()
        )));
    }
    if !ACCEPTED_TYPES.contains(&file.content_type.as_str()) {
        return Err(AppError::BadRequest(format!(
            "Unsupported file type '{}'.",
            file.content_type
        )));
    }
    Ok(())
}

pub async fn read_upload(mut multipart: Multipart) -> Result<Upload, AppError> {
    let mut upload = Upload::default();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let file_name = field.file_name().unwrap_or("upload").to_string();
            let content_type = content_type_for(field.content_type(), &file_name);
            let bytes = field.bytes().await?.to_vec();
            let file = UploadedFile {
                file_name,
                content_type,
                bytes,
            };
            check_file(&file)?;
            upload.file = Some(file);
        } else if !name.is_empty() {
            upload.fields.insert(name, field.text().await?);
        }
    }
    Ok(upload)
}

#[cfg(test)]
mod tests {
    use super::{check_file, content_type_for, UploadedFile, MAX_UPLOAD_BYTES};

    fn file(content_type: &str, size: usize) -> UploadedFile {
        UploadedFile {
            file_name: "scan.jpg".to_string(),
            content_type: content_type.to_string(),
            bytes: vec![1; size],
        }
    }

    #[test]
    fn accepts_images_and_pdfs_within_limit() {
        assert!(check_file(&file("image/jpeg", 10)).is_ok());
        assert!(check_file(&file("application/pdf", 10)).is_ok());
        assert!(check_file(&file("text/html", 10)).is_err());
        assert!(check_file(&file("image/png", 0)).is_err());
        assert!(check_file(&file("image/png", MAX_UPLOAD_BYTES + 1)).is_err());
    }

    #[test]
    fn falls_back_to_extension_for_generic_types() {
        assert_eq!(content_type_for(Some("application/octet-stream"), "a.PNG"), "image/png");
        assert_eq!(content_type_for(Some("Image/JPEG"), "a.bin"), "image/jpeg");
        assert_eq!(content_type_for(None, "license.pdf"), "application/pdf");
    }
}
