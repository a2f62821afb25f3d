//! The core stub content source implementation provided by ferry.

use ferry_api::{content::*, *};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-memory content source. This is NOT a production module. It is for
/// testing only. Test code inserts payloads directly; each
/// [ContentSource::open] call hands out a fresh one-shot cursor over
/// the stored bytes.
#[derive(Debug, Default)]
pub struct MemContentSource {
    held: Mutex<HashMap<ContentId, (bytes::Bytes, String)>>,
}

impl MemContentSource {
    /// Construct a new MemContentSource.
    pub fn create() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert content this source should serve.
    pub fn insert(
        &self,
        content_id: ContentId,
        data: bytes::Bytes,
        mime_type: String,
    ) {
        self.held
            .lock()
            .unwrap()
            .insert(content_id, (data, mime_type));
    }
}

impl ContentSource for MemContentSource {
    fn open(
        &self,
        content_id: ContentId,
    ) -> BoxFut<'_, FerryResult<Option<OriginStream>>> {
        Box::pin(async move {
            let held = self.held.lock().unwrap();
            Ok(held.get(&content_id).map(|(data, mime_type)| {
                OriginStream {
                    reader: Box::new(std::io::Cursor::new(data.to_vec())),
                    length: Some(data.len() as u64),
                    mime_type: mime_type.clone(),
                }
            }))
        })
    }
}
