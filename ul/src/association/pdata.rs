//! P-Data fragmentation module

use std::io::Write;

use crate::pdu::PDataValueType;

/// A P-Data value writer.
///
/// This exposes an API to iteratively construct and send DIMSE payloads
/// to another node.
/// Using this as a [standard writer](std::io::Write)
/// will automatically split the incoming bytes
/// into separate PDUs if they do not fit in a single one,
/// so that no encoded P-DATA-TF PDU
/// exceeds the peer's maximum PDU length.
///
/// Use an association's `send_pdata` method
/// to create a new P-Data value writer.
#[must_use]
pub struct PDataWriter<W: Write> {
    buffer: Vec<u8>,
    stream: W,
    presentation_context_id: u8,
    value_type: PDataValueType,
    max_data_length: u32,
}

impl<W> PDataWriter<W>
where
    W: Write,
{
    /// Construct a new P-Data value writer for data set payloads.
    pub(crate) fn new(stream: W, presentation_context_id: u8, max_pdu_length: u32) -> Self {
        Self::new_with_type(
            stream,
            presentation_context_id,
            max_pdu_length,
            PDataValueType::Data,
        )
    }

    pub(crate) fn new_with_type(
        stream: W,
        presentation_context_id: u8,
        max_pdu_length: u32,
        value_type: PDataValueType,
    ) -> Self {
        let max_data_length = calculate_max_data_len_single(max_pdu_length);
        PDataWriter {
            stream,
            presentation_context_id,
            value_type,
            max_data_length,
            buffer: Vec::with_capacity(max_data_length.min(16_384) as usize),
        }
    }

    /// Send the header of a single P-Data PDU,
    /// containing a single data fragment.
    fn send_pdata_header(&mut self, data_len: u32, is_last: bool) -> std::io::Result<()> {
        let mut message_header = 0x00;
        if let PDataValueType::Command = self.value_type {
            message_header |= 0x01;
        }
        if is_last {
            message_header |= 0x02;
        }

        let pdu_len_bytes = (data_len + 2 + 4).to_be_bytes();
        let data_len_bytes = (data_len + 2).to_be_bytes();
        let header = [
            // PDU-type + reserved byte
            0x04,
            0x00,
            // full PDU length
            pdu_len_bytes[0],
            pdu_len_bytes[1],
            pdu_len_bytes[2],
            pdu_len_bytes[3],
            // presentation data length (data + 2 properties below)
            data_len_bytes[0],
            data_len_bytes[1],
            data_len_bytes[2],
            data_len_bytes[3],
            // presentation context id
            self.presentation_context_id,
            // message control header
            message_header,
        ];

        self.stream.write_all(&header)
    }

    /// Flush the remaining buffered bytes as the last fragment.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.finish_impl()?;
        self.stream.flush()
    }

    fn finish_impl(&mut self) -> std::io::Result<()> {
        self.dispatch_excess_data()?;
        // send the last PDU; an empty last fragment is legal
        self.send_pdata_header(self.buffer.len() as u32, true)?;
        self.stream.write_all(&self.buffer[..])?;
        self.buffer.clear();
        Ok(())
    }

    fn dispatch_excess_data(&mut self) -> std::io::Result<()> {
        while self.buffer.len() > self.max_data_length as usize {
            self.send_pdata_header(self.max_data_length, false)?;
            self.stream
                .write_all(&self.buffer[..self.max_data_length as usize])?;
            self.buffer.drain(..self.max_data_length as usize);
        }
        Ok(())
    }
}

impl<W> Write for PDataWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend(buf);
        self.dispatch_excess_data()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // do nothing: fragments are only final on `finish`
        Ok(())
    }
}

/// Determine the maximum length of actual data
/// when encapsulated in a PDU with the given length property.
/// Does not account for the first 6 bytes (type + reserved + length).
#[inline]
fn calculate_max_data_len_single(pdu_len: u32) -> u32 {
    // data length (4 bytes) + context id + message control header
    pdu_len - 4 - 2
}

/// Split a fully assembled payload into P-Data PDUs,
/// so that no encoded PDU exceeds the peer's maximum PDU length.
///
/// This is the value-based counterpart of [`PDataWriter`],
/// used where PDUs are queued instead of written to a stream.
pub fn fragment_pdata(
    presentation_context_id: u8,
    value_type: PDataValueType,
    data: Vec<u8>,
    max_pdu_length: u32,
) -> Vec<crate::pdu::Pdu> {
    let max_data_length = calculate_max_data_len_single(max_pdu_length) as usize;

    if data.len() <= max_data_length {
        return vec![crate::pdu::Pdu::PData {
            data: vec![crate::pdu::PDataValue {
                presentation_context_id,
                value_type,
                is_last: true,
                data,
            }],
        }];
    }

    let mut pdus = Vec::with_capacity(data.len() / max_data_length + 1);
    let mut chunks = data.chunks(max_data_length).peekable();
    while let Some(chunk) = chunks.next() {
        pdus.push(crate::pdu::Pdu::PData {
            data: vec![crate::pdu::PDataValue {
                presentation_context_id,
                value_type,
                is_last: chunks.peek().is_none(),
                data: chunk.to_vec(),
            }],
        });
    }
    pdus
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::pdu::{pdu_length, read_pdu, PDataValueType, Pdu, MINIMUM_PDU_SIZE};

    use super::PDataWriter;

    #[test]
    fn write_pdata_and_finish() {
        let presentation_context_id = 12;

        let mut buf = Vec::new();
        {
            let mut writer = PDataWriter::new(&mut buf, presentation_context_id, MINIMUM_PDU_SIZE);
            writer.write_all(&(0..64).collect::<Vec<u8>>()).unwrap();
            writer.finish().unwrap();
        }

        let same_pdu = read_pdu(&buf, MINIMUM_PDU_SIZE, true).unwrap();

        match same_pdu {
            Pdu::PData { data } => {
                let data_1 = &data[0];

                assert_eq!(data_1.value_type, PDataValueType::Data);
                assert_eq!(data_1.presentation_context_id, presentation_context_id);
                assert!(data_1.is_last);
                assert_eq!(data_1.data.len(), 64);
                assert_eq!(data_1.data, (0..64).collect::<Vec<u8>>());
            }
            pdu => panic!("expected P-Data, got {:?}", pdu),
        }

        assert_eq!(pdu_length(&buf), Some(buf.len()));
    }

    #[test]
    fn write_large_pdata_and_finish() {
        let presentation_context_id = 32;

        let my_data: Vec<_> = (0..9000).map(|x| x as u8).collect();

        let mut buf = Vec::new();
        {
            let mut writer = PDataWriter::new(&mut buf, presentation_context_id, MINIMUM_PDU_SIZE);
            writer.write_all(&my_data).unwrap();
            writer.finish().unwrap();
        }

        // read back all PDUs and concatenate the fragments
        let mut cursor = &buf[..];
        let mut all_data = Vec::new();
        let mut pdu_count = 0;
        while !cursor.is_empty() {
            let n = pdu_length(cursor).expect("incomplete PDU in stream");
            match read_pdu(&cursor[..n], MINIMUM_PDU_SIZE, true).unwrap() {
                Pdu::PData { data } => {
                    for value in data {
                        // no encoded PDU may exceed the advertised maximum
                        assert!(n as u32 <= MINIMUM_PDU_SIZE + 6);
                        assert_eq!(value.presentation_context_id, presentation_context_id);
                        all_data.extend(value.data);
                    }
                }
                pdu => panic!("expected P-Data, got {:?}", pdu),
            }
            cursor = &cursor[n..];
            pdu_count += 1;
        }

        assert!(pdu_count > 1);
        assert_eq!(all_data, my_data);
    }

    #[test]
    fn fragment_pdata_honors_the_limit() {
        let data: Vec<u8> = (0..10_000).map(|x| x as u8).collect();
        let pdus = super::fragment_pdata(
            7,
            PDataValueType::Command,
            data.clone(),
            MINIMUM_PDU_SIZE,
        );
        assert!(pdus.len() > 1);

        let mut all_data = Vec::new();
        for (i, pdu) in pdus.iter().enumerate() {
            let mut bytes = Vec::new();
            crate::pdu::write_pdu(&mut bytes, pdu).unwrap();
            assert!(bytes.len() as u32 <= MINIMUM_PDU_SIZE + 6);

            match pdu {
                Pdu::PData { data } => {
                    assert_eq!(data[0].value_type, PDataValueType::Command);
                    assert_eq!(data[0].is_last, i == pdus.len() - 1);
                    all_data.extend_from_slice(&data[0].data);
                }
                pdu => panic!("expected P-Data, got {:?}", pdu),
            }
        }
        assert_eq!(all_data, data);
    }

    #[test]
    fn one_byte_over_the_limit_splits() {
        let max_data = MINIMUM_PDU_SIZE - 6;
        let my_data = vec![0u8; max_data as usize + 1];

        let mut buf = Vec::new();
        {
            let mut writer = PDataWriter::new(&mut buf, 1, MINIMUM_PDU_SIZE);
            writer.write_all(&my_data).unwrap();
            writer.finish().unwrap();
        }

        let n = pdu_length(&buf).unwrap();
        let first = read_pdu(&buf[..n], MINIMUM_PDU_SIZE, true).unwrap();
        let second = read_pdu(&buf[n..], MINIMUM_PDU_SIZE, true).unwrap();

        match (first, second) {
            (Pdu::PData { data: first }, Pdu::PData { data: second }) => {
                assert!(!first[0].is_last);
                assert_eq!(first[0].data.len(), max_data as usize);
                assert!(second[0].is_last);
                assert_eq!(second[0].data.len(), 1);
            }
            other => panic!("expected two P-Data PDUs, got {:?}", other),
        }
    }
}
