//! JPEG marker segment writers.
//!
//! Every chunk starts with a 0xFF?? marker code followed by the payload
//! size *not counting the marker itself*, hence the recurring `+ 2` in the
//! reservations. All writers short-circuit through the encoder's `ok` flag
//! so a failed metadata chunk aborts the whole bitstream.

use crate::consts::{marker, ZIGZAG};
use crate::encode::Encoder;
use crate::error::{Error, Result};
use crate::md5;

/// Largest marker payload (the 2-byte length field counts itself).
const MAX_PAYLOAD: usize = 0xffff - 2;

/// SOI + APP0 (JFIF 1.01, 1:1 aspect ratio, no thumbnail).
const HEADER_APP0: [u8; 20] = [
    0xff, marker::SOI, //
    0xff, marker::APP0, 0x00, 0x10, //
    0x4a, 0x46, 0x49, 0x46, 0x00, // 'JFIF'
    0x01, 0x01, // v1.01
    0x00, 0x00, 0x01, 0x00, 0x01, // aspect ratio 1:1
    0x00, 0x00, // no thumbnail
];

/// XMP APP1 namespace prefix, including the terminating NUL.
const XMP_PREFIX: &[u8] = b"http://ns.adobe.com/xap/1.0/\0";
/// Extended-XMP APP1 namespace prefix, including the terminating NUL.
const XMP_EXT_PREFIX: &[u8] = b"http://ns.adobe.com/xmp/extension/\0";
/// Attribute announcing the extension GUID inside the main XMP packet.
const XMP_NOTE_TAG: &[u8] = b"xmpNote:HasExtendedXMP=\"";
/// Largest main XMP packet; anything bigger is split into extension chunks.
const XMP_MAIN_SIZE: usize = 65503;
/// Extension chunk payload size.
const XMP_EXT_CHUNK: usize = 65458;

impl Encoder<'_> {
    pub(crate) fn put_16b(&mut self, v: u32) {
        self.bw.put_byte((v >> 8) as u8);
        self.bw.put_byte(v as u8);
    }

    pub(crate) fn put_32b(&mut self, v: u32) {
        self.put_16b(v >> 16);
        self.put_16b(v & 0xffff);
    }

    pub(crate) fn write_app0(&mut self) {
        self.bw.reserve(HEADER_APP0.len());
        self.bw.put_bytes(&HEADER_APP0);
    }

    /// Custom APP markers are written verbatim, right after APP0.
    pub(crate) fn write_app_markers(&mut self) -> Result<()> {
        if self.app_markers.is_empty() {
            return Ok(());
        }
        self.bw.reserve(self.app_markers.len());
        let data = self.app_markers;
        self.bw.put_bytes(data);
        Ok(())
    }

    pub(crate) fn write_exif(&mut self) -> Result<()> {
        if self.exif.is_empty() {
            return Ok(());
        }
        const EXIF_PREFIX: &[u8] = b"Exif\0\0";
        let data_size = self.exif.len() + EXIF_PREFIX.len() + 2;
        if data_size > 0xffff {
            self.ok = false;
            return Err(Error::MetadataTooLarge {
                kind: "EXIF",
                size: self.exif.len(),
                max: MAX_PAYLOAD - EXIF_PREFIX.len(),
            });
        }
        self.bw.reserve(data_size + 2);
        self.put_16b(0xff00 | marker::APP1 as u32);
        self.put_16b(data_size as u32);
        self.bw.put_bytes(EXIF_PREFIX);
        let data = self.exif;
        self.bw.put_bytes(data);
        Ok(())
    }

    pub(crate) fn write_iccp(&mut self) -> Result<()> {
        if self.iccp.is_empty() {
            return Ok(());
        }
        const ICCP_PREFIX: &[u8] = b"ICC_PROFILE\0";
        let chunk_size_max = 0xffff - ICCP_PREFIX.len() - 4;
        let num_chunks = (self.iccp.len() + chunk_size_max - 1) / chunk_size_max;
        if num_chunks >= 256 {
            self.ok = false;
            return Err(Error::IccpTooManyChunks { chunks: num_chunks });
        }
        let mut remaining = self.iccp;
        let mut seq = 1u32;
        while !remaining.is_empty() {
            let size = remaining.len().min(chunk_size_max);
            let total_size = size + ICCP_PREFIX.len() + 4;
            self.bw.reserve(total_size + 2);
            self.put_16b(0xff00 | marker::APP2 as u32);
            self.put_16b(total_size as u32);
            self.bw.put_bytes(ICCP_PREFIX);
            self.bw.put_byte(seq as u8);
            self.bw.put_byte(num_chunks as u8);
            let (chunk, rest) = remaining.split_at(size);
            self.bw.put_bytes(chunk);
            remaining = rest;
            seq += 1;
        }
        Ok(())
    }

    pub(crate) fn write_xmp(&mut self) -> Result<()> {
        if self.xmp.is_empty() {
            return Ok(());
        }
        let data_size = 2 + self.xmp.len() + XMP_PREFIX.len();
        if data_size <= 0xffff {
            self.bw.reserve(data_size + 2);
            self.put_16b(0xff00 | marker::APP1 as u32);
            self.put_16b(data_size as u32);
            self.bw.put_bytes(XMP_PREFIX);
            let data = self.xmp;
            self.bw.put_bytes(data);
            return Ok(());
        }
        // too big for one marker: split into a main packet plus extension
        self.write_xmp_extended()
    }

    /// Split an oversize XMP packet: the main part keeps the leading
    /// `XMP_MAIN_SIZE` bytes with the extension GUID patched into its
    /// `xmpNote:HasExtendedXMP` attribute; the rest goes out in numbered
    /// extension chunks carrying the GUID, total size and byte offset.
    fn write_xmp_extended(&mut self) -> Result<()> {
        let data = self.xmp;
        if data.len() > (1usize << 31) {
            self.ok = false;
            return Err(Error::MetadataTooLarge {
                kind: "XMP",
                size: data.len(),
                max: 1 << 31,
            });
        }
        let split = XMP_MAIN_SIZE.min(data.len());
        let note_pos = data
            .windows(XMP_NOTE_TAG.len())
            .position(|w| w == XMP_NOTE_TAG)
            .ok_or(Error::XmpMissingExtensionTag)
            .map_err(|e| {
                self.ok = false;
                e
            })?;
        let guid_pos = note_pos + XMP_NOTE_TAG.len();
        if guid_pos + 32 + 1 > split || data[guid_pos + 32] != b'"' {
            self.ok = false;
            return Err(Error::XmpMissingExtensionTag);
        }

        let (main_part, ext_part) = data.split_at(split);
        let guid = md5::digest_hex_upper(ext_part);
        let mut main_data = main_part.to_vec();
        main_data[guid_pos..guid_pos + 32].copy_from_slice(&guid);

        // main packet
        let data_size = 2 + main_data.len() + XMP_PREFIX.len();
        debug_assert!(data_size <= 0xffff);
        self.bw.reserve(data_size + 2);
        self.put_16b(0xff00 | marker::APP1 as u32);
        self.put_16b(data_size as u32);
        self.bw.put_bytes(XMP_PREFIX);
        self.bw.put_bytes(&main_data);

        // extension chunks: prefix + GUID + full size + offset, then bytes
        let header_size = XMP_EXT_PREFIX.len() + 32 + 4 + 4;
        let mut read_pos = 0usize;
        while read_pos < ext_part.len() {
            let write_size = XMP_EXT_CHUNK.min(ext_part.len() - read_pos);
            self.bw.reserve(2 + 2 + header_size + write_size);
            self.put_16b(0xff00 | marker::APP1 as u32);
            self.put_16b((2 + header_size + write_size) as u32);
            self.bw.put_bytes(XMP_EXT_PREFIX);
            self.bw.put_bytes(&guid);
            self.put_32b(ext_part.len() as u32);
            self.put_32b(read_pos as u32);
            self.bw.put_bytes(&ext_part[read_pos..read_pos + write_size]);
            read_pos += write_size;
        }
        Ok(())
    }

    pub(crate) fn write_dqt(&mut self) {
        let num_matrices = if self.nb_comps == 1 { 1 } else { 2 };
        let data_size = num_matrices * 65 + 2;
        self.bw.reserve(data_size + 2);
        self.put_16b(0xff00 | marker::DQT as u32);
        self.put_16b(data_size as u32);
        for n in 0..num_matrices {
            self.bw.put_byte(n as u8);
            for i in 0..64 {
                let v = self.quants[n].quant[ZIGZAG[i]];
                self.bw.put_byte(v);
            }
        }
    }

    pub(crate) fn write_sof(&mut self) {
        let data_size = 8 + 3 * self.nb_comps;
        debug_assert!(data_size <= 255);
        self.bw.reserve(data_size + 2);
        self.put_16b(0xff00 | marker::SOF0 as u32);
        self.put_16b(data_size as u32);
        self.bw.put_byte(8); // 8 bits per component
        self.put_16b(self.h as u32);
        self.put_16b(self.w as u32);
        self.bw.put_byte(self.nb_comps as u8);
        for c in 0..self.nb_comps {
            self.bw.put_byte(c as u8 + 1);
            let dims = self.block_dims[c];
            self.bw.put_byte(dims);
            self.bw.put_byte(self.quant_idx[c] as u8);
        }
    }

    pub(crate) fn write_dht(&mut self) {
        self.init_codes(false);
        let nb_tables = if self.nb_comps == 1 { 1 } else { 2 };
        for c in 0..nb_tables {
            for htype in 0..=1usize {
                let h = &self.huffman_tables[htype * 2 + c];
                let data_size = 3 + 16 + h.nb_syms();
                debug_assert!(data_size <= 255);
                let bits = h.bits;
                let syms = h.syms.clone();
                self.bw.reserve(data_size + 2);
                self.put_16b(0xff00 | marker::DHT as u32);
                self.put_16b(data_size as u32);
                self.bw.put_byte(((htype << 4) | c) as u8);
                self.bw.put_bytes(&bits);
                self.bw.put_bytes(&syms);
            }
        }
    }

    pub(crate) fn write_sos(&mut self) {
        let data_size = 6 + self.nb_comps * 2;
        debug_assert!(data_size <= 255);
        self.bw.reserve(data_size + 2);
        self.put_16b(0xff00 | marker::SOS as u32);
        self.put_16b(data_size as u32);
        self.bw.put_byte(self.nb_comps as u8);
        for c in 0..self.nb_comps {
            self.bw.put_byte(c as u8 + 1);
            // both DC and AC table slots track the quantizer index
            self.bw.put_byte((self.quant_idx[c] * 0x11) as u8);
        }
        self.bw.put_byte(0x00); // Ss
        self.bw.put_byte(0x3f); // Se
        self.bw.put_byte(0x00); // Ah/Al
    }

    pub(crate) fn write_eoi(&mut self) {
        self.bw.reserve(8);
        self.bw.flush();
        self.put_16b(0xff00 | marker::EOI as u32);
    }
}
