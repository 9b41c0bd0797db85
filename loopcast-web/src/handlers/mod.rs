//! HTTP request handlers organized by functionality

pub mod sources;
pub mod stream;

// Re-export handler functions
pub use sources::{
    IndexRequest, LocalSourceRequest, LocalVideo, ManualEntryRequest, ResolveRequest,
    SelectedSource, UploadQuery, api_create_manual_entry, api_index_folder, api_local_videos,
    api_resolve_entry, api_select_local, api_select_remote, api_selected_source,
    api_upload_source,
};
pub use stream::{api_acknowledge, api_start_stream, api_stop_stream, api_stream_status};
