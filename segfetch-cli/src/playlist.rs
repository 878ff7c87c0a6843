//! Playlist resolution: turns an HLS playlist into a [`MediaDownload`].

use m3u8_rs::{Key, KeyMethod, MasterPlaylist, MediaPlaylist, Playlist, parse_playlist_res};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use segfetch_engine::decryption::METHOD_AES_128;
use segfetch_engine::{
    DecryptionKey, MediaDownload, RequestConfig, SegmentDescriptor, TransferManager,
};

use crate::error::{AppError, Result};

/// Fetch `url` and build the download for its media playlist.
///
/// Master playlists resolve to their highest bandwidth variant.
pub async fn resolve(
    manager: &TransferManager,
    url: &Url,
    out_dir: &Path,
    request: &Arc<RequestConfig>,
) -> Result<MediaDownload> {
    let (playlist, playlist_url) = match parse(&fetch(manager, url, request).await?)? {
        Playlist::MediaPlaylist(playlist) => (playlist, url.clone()),
        Playlist::MasterPlaylist(master) => {
            let variant_url = select_variant(&master, url)?;
            info!(variant = %variant_url, "Selected highest bandwidth variant");
            match parse(&fetch(manager, &variant_url, request).await?)? {
                Playlist::MediaPlaylist(playlist) => (playlist, variant_url),
                Playlist::MasterPlaylist(_) => {
                    return Err(AppError::Playlist(format!(
                        "variant {variant_url} is a master playlist"
                    )));
                }
            }
        }
    };

    let mut keys = HashMap::new();
    for key_url in key_urls(&playlist, &playlist_url)? {
        let bytes = fetch(manager, &key_url, request).await?;
        debug!(key = %key_url, len = bytes.len(), "Fetched decryption key");
        keys.insert(key_url, bytes);
    }

    build_download(&playlist, &playlist_url, out_dir, &keys, request)
}

async fn fetch(
    manager: &TransferManager,
    url: &Url,
    request: &RequestConfig,
) -> Result<bytes::Bytes> {
    manager
        .fetch_bytes(url, request)
        .await?
        .ok_or(AppError::Interrupted)
}

fn parse(bytes: &[u8]) -> Result<Playlist> {
    parse_playlist_res(bytes).map_err(|e| AppError::Playlist(format!("failed to parse playlist: {e}")))
}

/// URL of the variant with the highest bandwidth.
pub fn select_variant(master: &MasterPlaylist, base: &Url) -> Result<Url> {
    let variant = master
        .variants
        .iter()
        .filter(|v| !v.is_i_frame)
        .max_by_key(|v| v.bandwidth)
        .ok_or_else(|| AppError::Playlist("master playlist has no variants".to_string()))?;
    Ok(base.join(&variant.uri)?)
}

/// Key state carried from one segment to the next.
fn key_updates(playlist: &MediaPlaylist) -> Vec<Option<&Key>> {
    let mut current: Option<&Key> = None;
    playlist
        .segments
        .iter()
        .map(|segment| {
            if let Some(key) = &segment.key {
                current = (key.method != KeyMethod::None).then_some(key);
            }
            current
        })
        .collect()
}

/// Distinct key URIs referenced by the playlist, resolved against `base`.
pub fn key_urls(playlist: &MediaPlaylist, base: &Url) -> Result<Vec<Url>> {
    let mut urls: Vec<Url> = Vec::new();
    for key in key_updates(playlist).into_iter().flatten() {
        let url = key_url(key, base)?;
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
    Ok(urls)
}

fn key_url(key: &Key, base: &Url) -> Result<Url> {
    if key.method != KeyMethod::AES128 {
        return Err(AppError::Playlist(format!(
            "unsupported encryption method {:?}",
            key.method
        )));
    }
    let uri = key
        .uri
        .as_deref()
        .ok_or_else(|| AppError::Playlist("EXT-X-KEY without URI".to_string()))?;
    Ok(base.join(uri)?)
}

/// Build descriptors writing segment `i` to `<out_dir>/<i>.ts`.
pub fn build_download(
    playlist: &MediaPlaylist,
    base: &Url,
    out_dir: &Path,
    keys: &HashMap<Url, bytes::Bytes>,
    request: &Arc<RequestConfig>,
) -> Result<MediaDownload> {
    let segments = playlist
        .segments
        .iter()
        .zip(key_updates(playlist))
        .enumerate()
        .map(|(index, (segment, key))| {
            let uri = base.join(&segment.uri)?;
            let mut descriptor = SegmentDescriptor::new(uri, out_dir.join(format!("{index}.ts")))
                .with_request(Arc::clone(request));
            if let Some(key) = key {
                let key_url = key_url(key, base)?;
                let material = keys.get(&key_url).ok_or_else(|| {
                    AppError::Playlist(format!("key {key_url} was not fetched"))
                })?;
                let iv = match key.iv.as_deref() {
                    Some(iv) => DecryptionKey::parse_iv(iv)?,
                    None => DecryptionKey::iv_from_sequence(playlist.media_sequence + index as u64),
                };
                descriptor =
                    descriptor.with_key(Arc::new(DecryptionKey::new(material, iv, METHOD_AES_128)?));
            }
            Ok(descriptor)
        })
        .collect::<Result<Vec<_>>>()?;

    if segments.is_empty() {
        return Err(AppError::Playlist("playlist has no segments".to_string()));
    }
    let id = base
        .path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or("playlist")
        .to_string();
    Ok(MediaDownload::new(id, base.clone(), segments))
}
