use tokio::io::{AsyncRead, AsyncReadExt};

// RFC 5531 record marking as used by ledger close streams: a 4 byte
// big-endian header whose high bit flags the final fragment and whose
// low 31 bits carry the payload length.
const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Cap on a single frame, anything larger is a corrupt stream
pub const MAX_FRAME_BYTES: u32 = 128 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
	#[error("Frame length {0} exceeds limit")]
	Oversized(u32),
	#[error("Continuation fragments are not supported")]
	Fragmented,
	#[error("Truncated frame: wanted {wanted} bytes, stream ended")]
	Truncated { wanted: usize },
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// Read one framed record, `Ok(None)` at clean end of stream
pub async fn read_frame<R: AsyncRead + Unpin>(
	reader: &mut R,
) -> Result<Option<Vec<u8>>, FrameError> {
	let mut header = [0u8; 4];
	match reader.read_exact(&mut header).await {
		Ok(_) => {},
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(e) => return Err(e.into()),
	}
	let word = u32::from_be_bytes(header);
	if word & LAST_FRAGMENT == 0 {
		return Err(FrameError::Fragmented);
	}
	let len = word & !LAST_FRAGMENT;
	if len > MAX_FRAME_BYTES {
		return Err(FrameError::Oversized(len));
	}
	let mut payload = vec![0u8; len as usize];
	reader
		.read_exact(&mut payload)
		.await
		.map_err(|_| FrameError::Truncated { wanted: len as usize })?;
	Ok(Some(payload))
}

/// Frame a payload for the wire, used by fixtures and tests
pub fn write_frame(out: &mut Vec<u8>, payload: &[u8]) {
	let header = LAST_FRAGMENT | payload.len() as u32;
	out.extend_from_slice(&header.to_be_bytes());
	out.extend_from_slice(payload);
}
