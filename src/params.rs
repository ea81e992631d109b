//! params -- FCGI name-value pair encoding.
//!
//! "FastCGI transmits a name-value pair as the length of the name, followed by the length of the value,
//! followed by the name, followed by the value. Lengths of 127 bytes and less can be encoded in one byte,
//! while longer lengths are always encoded in four bytes" - FCGI spec
//
use crate::error::FcgiError;

/// High bit of the first length byte marks the 4-byte form.
const MULTIBYTE_FLAG: u8 = 0x80;

/// Fetch one encoded length and advance past it. None if the bytes aren't all there.
/// 0..127 is one byte.
/// If the first byte is larger than 127, use it and 3 more bytes as a 31-bit big-endian value.
fn fetch_field_length(data: &mut &[u8]) -> Option<usize> {
    let b0 = *data.first()?;
    if b0 & MULTIBYTE_FLAG == 0 {
        *data = &data[1..];
        return Some(b0 as usize);
    }
    if data.len() < 4 {
        return None;
    }
    let v = u32::from_be_bytes([b0 & 0x7f, data[1], data[2], data[3]]);
    *data = &data[4..];
    Some(v as usize)
}

/// Convert one param field to UTF-8.
fn field_to_string(field: &[u8]) -> Result<String, FcgiError> {
    String::from_utf8(field.to_vec())
        .map_err(|e| FcgiError::Decode(format!("param field is not UTF-8: {}", e)))
}

/// Fetch one complete name-value pair from the front of `data`.
/// Ok(None) if the pair runs past the end of the data.
fn fetch_name_value_pair(data: &mut &[u8]) -> Result<Option<(String, String)>, FcgiError> {
    let mut pos = *data;
    let Some(name_len) = fetch_field_length(&mut pos) else {
        return Ok(None);
    };
    let Some(value_len) = fetch_field_length(&mut pos) else {
        return Ok(None);
    };
    if pos.len() < name_len || pos.len() - name_len < value_len {
        return Ok(None);
    }
    let (name, rest) = pos.split_at(name_len);
    let (value, rest) = rest.split_at(value_len);
    let pair = (field_to_string(name)?, field_to_string(value)?);
    *data = rest;
    Ok(Some(pair))
}

/// Decode the complete pairs at the front of `data`.
///
/// Returns the pairs and the number of bytes they used. A trailing
/// partial pair is left for the caller to complete with more data.
pub fn decode_params_partial(mut data: &[u8]) -> Result<(Vec<(String, String)>, usize), FcgiError> {
    let total = data.len();
    let mut pairs = Vec::new();
    while !data.is_empty() {
        match fetch_name_value_pair(&mut data)? {
            Some((name, value)) => {
                log::trace!("Param: \"{}\" = \"{}\"", name, value);
                pairs.push((name, value));
            }
            None => break,
        }
    }
    Ok((pairs, total - data.len()))
}

/// Decode a whole param block into name-value pairs, in wire order.
///
/// The block must be consumed exactly. A length that runs past
/// the end is an error, never a silent stop.
pub fn decode_params(data: &[u8]) -> Result<Vec<(String, String)>, FcgiError> {
    let (pairs, used) = decode_params_partial(data)?;
    if used != data.len() {
        return Err(FcgiError::Decode(format!(
            "name-value pair overruns param block at byte {} of {}",
            used,
            data.len()
        )));
    }
    Ok(pairs)
}

fn put_field_length(out: &mut Vec<u8>, len: usize) {
    if len < MULTIBYTE_FLAG as usize {
        out.push(len as u8);
    } else {
        assert!(len <= 0x7fff_ffff, "param length overflow");
        out.extend_from_slice(&(len as u32 | 0x8000_0000).to_be_bytes());
    }
}

/// Encode name-value pairs as a param block.
pub fn encode_params<N: AsRef<str>, V: AsRef<str>>(pairs: &[(N, V)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in pairs {
        let (name, value) = (name.as_ref().as_bytes(), value.as_ref().as_bytes());
        put_field_length(&mut out, name.len());
        put_field_length(&mut out, value.len());
        out.extend_from_slice(name);
        out.extend_from_slice(value);
    }
    out
}

#[test]
fn decode_short_pair() {
    let block = [3, 5, b'K', b'E', b'Y', b'V', b'A', b'L', b'U', b'E'];
    let pairs = decode_params(&block).expect("decode failed");
    assert_eq!(pairs, vec![("KEY".to_string(), "VALUE".to_string())]);
}

#[test]
fn round_trip_length_boundaries() {
    for len in [0usize, 1, 127, 128, 129, 300, 70_000] {
        let pairs = vec![
            ("N".repeat(len), "v".to_string()),
            ("NAME".to_string(), "x".repeat(len)),
        ];
        let block = encode_params(&pairs);
        assert_eq!(decode_params(&block).expect("decode failed"), pairs, "len {}", len);
    }
}

#[test]
fn length_encoding_bytes() {
    let block = encode_params(&[("A".repeat(127), String::new())]);
    assert_eq!(&block[..2], &[127, 0]);
    let block = encode_params(&[("A".repeat(128), String::new())]);
    assert_eq!(&block[..5], &[0x80, 0, 0, 128, 0]);
}

#[test]
fn overrun_is_an_error() {
    //  Value length says 9, only 5 bytes present.
    let block = [3, 9, b'K', b'E', b'Y', b'V', b'A', b'L', b'U', b'E'];
    assert!(matches!(decode_params(&block), Err(FcgiError::Decode(_))));
    //  Multi-byte length cut off.
    assert!(matches!(decode_params(&[0x80, 0]), Err(FcgiError::Decode(_))));
    //  Name length with no value length.
    assert!(matches!(decode_params(&[3]), Err(FcgiError::Decode(_))));
}

#[test]
fn bad_utf8_is_an_error() {
    let block = [1, 1, 0xff, b'x'];
    assert!(matches!(decode_params(&block), Err(FcgiError::Decode(_))));
}

#[test]
fn partial_decode_keeps_split_pair() {
    let block = encode_params(&[("REQUEST_METHOD", "GET"), ("REQUEST_URI", "/split")]);
    let cut = block.len() - 3;
    let (pairs, used) = decode_params_partial(&block[..cut]).expect("decode failed");
    assert_eq!(pairs, vec![("REQUEST_METHOD".to_string(), "GET".to_string())]);
    assert_eq!(used, 2 + "REQUEST_METHOD".len() + 3);
    let (rest, used_rest) = decode_params_partial(&block[used..]).expect("decode failed");
    assert_eq!(rest, vec![("REQUEST_URI".to_string(), "/split".to_string())]);
    assert_eq!(used + used_rest, block.len());
}

#[test]
fn empty_block_has_no_pairs() {
    assert!(decode_params(&[]).expect("decode failed").is_empty());
}
