//! APDU framing and transport (C2).

use std::sync::Arc;

use pcsc::Card;
use tokio::sync::Mutex;

use crate::error::CardError;

const SW_SUCCESS: u16 = 0x9000;

/// A card handle shared between the orchestrator task and the blocking
/// pool that actually performs PC/SC transmits.
#[derive(Clone)]
pub struct CardHandle {
    card: Arc<Mutex<Card>>,
}

impl CardHandle {
    pub fn new(card: Card) -> Self {
        Self {
            card: Arc::new(Mutex::new(card)),
        }
    }
}

/// Builds the short-APDU frame `[cl, ins, p1, p2, len(data)] ++ data`.
///
/// `data` must be at most 255 bytes; this is the short-APDU format used
/// throughout the OATH exchange, never extended-length APDUs.
pub fn frame(cl: u8, ins: u8, p1: u8, p2: u8, data: &[u8]) -> Vec<u8> {
    assert!(data.len() <= 255, "APDU data exceeds short-frame limit");
    let mut out = Vec::with_capacity(5 + data.len());
    out.push(cl);
    out.push(ins);
    out.push(p1);
    out.push(p2);
    out.push(data.len() as u8);
    out.extend_from_slice(data);
    out
}

/// Splits a raw response into `(body, status word)`. The status word is
/// the last two bytes, big-endian.
fn split_response(raw: &[u8]) -> (&[u8], u16) {
    let (body, sw_bytes) = raw.split_at(raw.len() - 2);
    let sw = u16::from_be_bytes([sw_bytes[0], sw_bytes[1]]);
    (body, sw)
}

/// Sends a single command APDU and returns the response body, or
/// `CardError::ChkWrong` with the raw body (status word included) attached
/// if the status word was not `0x9000`.
pub async fn send_apdu(
    card: &CardHandle,
    cl: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Vec<u8>,
) -> Result<Vec<u8>, CardError> {
    let request = frame(cl, ins, p1, p2, &data);
    let card = card.card.clone();

    let raw = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, CardError> {
        let locked = card.blocking_lock();
        let mut buf = [0u8; pcsc::MAX_BUFFER_SIZE];
        let response = locked.transmit(&request, &mut buf)?;
        Ok(response.to_vec())
    })
    .await
    .expect("blocking transmit task panicked")?;

    let (body, sw) = split_response(&raw);
    if sw != SW_SUCCESS {
        return Err(CardError::ChkWrong {
            body: raw[..].to_vec(),
        });
    }
    Ok(body.to_vec())
}

/// `SELECT` helper: `send_apdu(0x00, 0xA4, 0x04, 0x00, aid)`.
pub async fn select_aid(card: &CardHandle, aid: &[u8]) -> Result<Vec<u8>, CardError> {
    send_apdu(card, 0x00, 0xA4, 0x04, 0x00, aid.to_vec()).await
}

/// Reads the card's serial number as a big-endian `u32`.
pub async fn read_serial(card: &CardHandle) -> Result<u32, CardError> {
    let body = send_apdu(card, 0x00, 0x01, 0x10, 0x00, Vec::new()).await?;
    if body.len() < 4 {
        return Err(CardError::ChkWrong { body });
    }
    Ok(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_matches_short_apdu_layout() {
        let f = frame(0x00, 0xA4, 0x04, 0x00, &[0xAA, 0xBB, 0xCC]);
        assert_eq!(f, vec![0x00, 0xA4, 0x04, 0x00, 0x03, 0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn frame_handles_empty_data() {
        let f = frame(0x00, 0x01, 0x10, 0x00, &[]);
        assert_eq!(f, vec![0x00, 0x01, 0x10, 0x00, 0x00]);
    }

    #[test]
    fn split_response_strips_success_status_word() {
        let raw = [0xDE, 0xAD, 0xBE, 0xEF, 0x90, 0x00];
        let (body, sw) = split_response(&raw);
        assert_eq!(body, &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(sw, 0x9000);
    }

    #[test]
    fn split_response_reports_failure_status_word() {
        let raw = [0x6A, 0x80];
        let (body, sw) = split_response(&raw);
        assert!(body.is_empty());
        assert_eq!(sw, 0x6A80);
    }
}
