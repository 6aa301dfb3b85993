//! OP_RETURN payload extraction.
//!
//! Only the first push after `OP_RETURN` is read:
//!
//! ```text
//! OP_RETURN <OP_PUSHBYTES_0..=OP_PUSHBYTES_75> <data>
//! OP_RETURN OP_PUSHDATA1 <u8 length> <data>
//! OP_RETURN OP_PUSHDATA2 <u16le length> <data>
//! OP_RETURN OP_PUSHDATA4 <u32le length> <data>
//! ```
//!
//! Anything else, including a declared length longer than the script, yields no payload.

use bitcoin::opcodes::all::{OP_PUSHBYTES_75, OP_PUSHDATA1, OP_PUSHDATA2, OP_PUSHDATA4, OP_RETURN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushForm {
    Direct,
    PushData1,
    PushData2,
    PushData4,
}

impl PushForm {
    /// Encodes the `OP_RETURN` + push header for a payload of `len` bytes in this form.
    ///
    /// Returns `None` if `len` does not fit the form.
    pub fn header(self, len: usize) -> Option<Vec<u8>> {
        let mut header = vec![OP_RETURN.to_u8()];
        match self {
            PushForm::Direct => {
                if len > OP_PUSHBYTES_75.to_u8() as usize {
                    return None;
                }
                header.push(len as u8);
            }
            PushForm::PushData1 => {
                header.push(OP_PUSHDATA1.to_u8());
                header.push(u8::try_from(len).ok()?);
            }
            PushForm::PushData2 => {
                header.push(OP_PUSHDATA2.to_u8());
                header.extend_from_slice(&u16::try_from(len).ok()?.to_le_bytes());
            }
            PushForm::PushData4 => {
                header.push(OP_PUSHDATA4.to_u8());
                header.extend_from_slice(&u32::try_from(len).ok()?.to_le_bytes());
            }
        }
        Some(header)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpReturnPush<'a> {
    pub form: PushForm,
    pub data: &'a [u8],
}

pub fn parse_op_return(script: &[u8]) -> Option<OpReturnPush> {
    if *script.first()? != OP_RETURN.to_u8() {
        return None;
    }

    // merely OP_RETURN
    let opcode = *script.get(1)?;
    let (form, len, start): (PushForm, usize, usize) = match opcode {
        x if x <= OP_PUSHBYTES_75.to_u8() => (PushForm::Direct, x as usize, 2),
        x if x == OP_PUSHDATA1.to_u8() => (PushForm::PushData1, *script.get(2)? as usize, 3),
        x if x == OP_PUSHDATA2.to_u8() => {
            let len = u16::from_le_bytes(script.get(2..4)?.try_into().ok()?);
            (PushForm::PushData2, len as usize, 4)
        }
        x if x == OP_PUSHDATA4.to_u8() => {
            let len = u32::from_le_bytes(script.get(2..6)?.try_into().ok()?);
            (PushForm::PushData4, usize::try_from(len).ok()?, 6)
        }
        _ => return None,
    };

    let data = script.get(start..start.checked_add(len)?)?;
    Some(OpReturnPush { form, data })
}

pub fn extract_op_return(script: &[u8]) -> Option<&[u8]> {
    parse_op_return(script).map(|x| x.data)
}

/// Like [`extract_op_return`], starting from the hex form the node reports.
pub fn extract_op_return_hex(script_hex: &str) -> Option<Vec<u8>> {
    let script = hex::decode(script_hex).ok()?;
    extract_op_return(&script).map(<[u8]>::to_vec)
}

#[cfg(test)]
mod test {
    use super::{extract_op_return, extract_op_return_hex, parse_op_return, PushForm};
    use hex_literal::hex;

    fn script_with(form: PushForm, payload: &[u8]) -> Vec<u8> {
        let mut script = form.header(payload.len()).unwrap();
        script.extend_from_slice(payload);
        script
    }

    #[test]
    fn all_push_forms_reencode_to_the_same_script() {
        let cases = [
            (PushForm::Direct, vec![0xab_u8; 75]),
            (PushForm::PushData1, vec![0x01_u8; 200]),
            (PushForm::PushData2, vec![0x02_u8; 1000]),
            (PushForm::PushData4, vec![0x04_u8; 70_000]),
        ];
        for (form, payload) in cases {
            let script = script_with(form, &payload);
            let push = parse_op_return(&script).unwrap();
            assert_eq!(push.form, form);
            assert_eq!(push.data, payload.as_slice());

            let mut reencoded = push.form.header(push.data.len()).unwrap();
            reencoded.extend_from_slice(push.data);
            assert_eq!(reencoded, script);
        }
    }

    #[test]
    fn known_script() {
        // OP_RETURN OP_PUSHBYTES_11 "hello world"
        let script = hex!("6a0b68656c6c6f20776f726c64");
        assert_eq!(extract_op_return(&script), Some(&b"hello world"[..]));
        assert_eq!(
            extract_op_return_hex("6a0b68656c6c6f20776f726c64"),
            Some(b"hello world".to_vec())
        );
    }

    #[test]
    fn not_op_return() {
        // p2pkh
        let script = hex!("76a91489abcdefabbaabbaabbaabbaabbaabbaabbaabba88ac");
        assert_eq!(extract_op_return(&script), None);
        assert_eq!(extract_op_return(&[]), None);
        assert_eq!(extract_op_return_hex("zz"), None);
    }

    #[test]
    fn too_short_or_unknown_opcode() {
        assert_eq!(extract_op_return(&hex!("6a")), None);
        // OP_PUSHDATA1 with no length byte
        assert_eq!(extract_op_return(&hex!("6a4c")), None);
        // OP_PUSHDATA2 with a single length byte
        assert_eq!(extract_op_return(&hex!("6a4d01")), None);
        // OP_1NEGATE is not a push
        assert_eq!(extract_op_return(&hex!("6a4f01")), None);
    }

    #[test]
    fn truncated_payload() {
        assert_eq!(extract_op_return(&hex!("6a05616263")), None);
        assert_eq!(extract_op_return(&hex!("6a4c0a0102")), None);
        assert_eq!(extract_op_return(&hex!("6a4e0000010001")), None);
    }

    #[test]
    fn pushdata4_length_past_the_end() {
        // OP_PUSHDATA4 claiming 0xffffffff bytes
        assert_eq!(extract_op_return(&hex!("6a4effffffff0102")), None);
        let push = parse_op_return(&hex!("6a4e03000000616263")).unwrap();
        assert_eq!(push.form, PushForm::PushData4);
        assert_eq!(push.data, b"abc");
    }

    #[test]
    fn empty_push_and_trailing_bytes() {
        assert_eq!(extract_op_return(&hex!("6a00")), Some(&[][..]));
        // only the first push is taken
        assert_eq!(extract_op_return(&hex!("6a026162026364")), Some(&b"ab"[..]));
    }

    #[test]
    fn header_rejects_oversized_lengths() {
        assert_eq!(PushForm::Direct.header(76), None);
        assert_eq!(PushForm::PushData1.header(256), None);
        assert_eq!(PushForm::PushData2.header(65_536), None);
    }
}
