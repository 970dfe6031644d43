//! Chained-fixups decoding.
//!
//! LC_DYLD_CHAINED_FIXUPS encodes relocation work as linked chains of
//! pointer-sized records embedded in the pages that need patching: each
//! record is either a rebase (the cell holds an address that must be slid to
//! the actual load address) or a bind (the cell must be overwritten with the
//! address of an external symbol). This module walks every chain and
//! flattens it into the rebase and bind lists the loader consumes; the
//! linked encoding never leaves the parser.

use tracing::{debug, debug_span, trace, warn};

use crate::mem::Window;
use crate::ObjectFormatError;

use super::commands::{Bind, ChainedFixupsCommand, Rebase};
use super::{
    CHAINED_PAGE_START_NONE, DYLD_CHAINED_PTR_64, DYLD_CHAINED_PTR_64_OFFSET,
    DYLD_CHAINED_PTR_ARM64E_USERLAND24,
};

/// Fixed header at the command's data offset.
struct FixupsHeader {
    version: u32,
    starts_offset: u32,
    imports_offset: u32,
    symbols_offset: u32,
    imports_count: u32,
    imports_format: u32,
    symbols_format: u32,
}

/// One entry of the imports table, name already resolved through the shared
/// string pool.
struct Import {
    lib_ordinal: u32,
    weak: bool,
    name: String,
}

/// Decodes a whole chained-fixups command. `cmd_reader` sits at the start of
/// the command; `image` is a window over the image the offsets are relative
/// to.
pub(crate) fn read_chained_fixups<W: Window>(
    cmd_reader: &mut W,
    image: &W,
) -> crate::Result<ChainedFixupsCommand> {
    let span = debug_span!("chained_fixups");
    let _enter = span.enter();

    cmd_reader.advance(8)?; // cmd + cmdsize
    let dataoff = cmd_reader.read_u32()?;
    let datasize = cmd_reader.read_u32()?;

    let mut header_reader = image.base_reader()?.child_from(dataoff as u64)?;
    let header = FixupsHeader {
        version: header_reader.read_u32()?,
        starts_offset: header_reader.read_u32()?,
        imports_offset: header_reader.read_u32()?,
        symbols_offset: header_reader.read_u32()?,
        imports_count: header_reader.read_u32()?,
        imports_format: header_reader.read_u32()?,
        symbols_format: header_reader.read_u32()?,
    };
    debug!(
        version = header.version,
        imports_count = header.imports_count,
        imports_format = header.imports_format,
        "fixups header"
    );

    if header.symbols_format != 0 {
        // Compressed (zlib) symbol names; see mach-o/fixup-chains.h.
        return Err(ObjectFormatError::CompressedSymbols(header.symbols_format).into());
    }

    let imports = read_imports(&header, &header_reader)?;

    let mut rebases = Vec::new();
    let mut binds = Vec::new();

    let mut starts_reader = header_reader
        .base_reader()?
        .child_from(header.starts_offset as u64)?;
    let seg_count = starts_reader.read_u32()?;
    for segment_index in 0..seg_count {
        let seg_info_offset = starts_reader.read_u32()?;
        if seg_info_offset == 0 {
            // Segment has no fixups.
            continue;
        }

        let mut seg_reader = starts_reader
            .base_reader()?
            .child_from(seg_info_offset as u64)?;
        let _size = seg_reader.read_u32()?;
        let page_size = seg_reader.read_u16()?;
        let pointer_format = seg_reader.read_u16()?;
        let segment_offset = seg_reader.read_u64()?;
        let _max_valid_pointer = seg_reader.read_u32()?;
        let page_count = seg_reader.read_u16()?;

        trace!(
            segment_index,
            pointer_format,
            page_size,
            page_count,
            segment_offset,
            "segment starts"
        );

        for page_index in 0..page_count {
            let page_start = seg_reader.read_u16()?;
            if page_start == CHAINED_PAGE_START_NONE {
                continue;
            }
            let start_in_segment = page_index as u64 * page_size as u64 + page_start as u64;
            let chain = image
                .base_reader()?
                .child_from(segment_offset + start_in_segment)?;
            walk_chain(
                chain,
                pointer_format,
                segment_index,
                start_in_segment,
                &imports,
                &mut rebases,
                &mut binds,
            )?;
        }
    }

    debug!(
        rebases = rebases.len(),
        binds = binds.len(),
        "decoded chained fixups"
    );
    Ok(ChainedFixupsCommand {
        dataoff,
        datasize,
        rebases,
        binds,
    })
}

fn read_imports<W: Window>(header: &FixupsHeader, header_reader: &W) -> crate::Result<Vec<Import>> {
    let mut imports = Vec::with_capacity(header.imports_count as usize);
    let mut imports_reader = header_reader
        .base_reader()?
        .child_from(header.imports_offset as u64)?;
    for _ in 0..header.imports_count {
        // Packed: 8-bit library ordinal, 1-bit weak flag, 23-bit name offset.
        let raw = imports_reader.read_u32()?;
        let lib_ordinal = raw & 0xff;
        let weak = (raw >> 8) & 0x1 == 1;
        let name_offset = (raw >> 9) & 0x7f_ffff;

        let mut name_reader = header_reader
            .base_reader()?
            .child_from(header.symbols_offset as u64 + name_offset as u64)?;
        let name = name_reader.read_cstring()?;
        trace!(ordinal = lib_ordinal, weak, name = %name, "import");
        imports.push(Import {
            lib_ordinal,
            weak,
            name,
        });
    }
    Ok(imports)
}

/// Walks one page's chain until a record with a zero next field. The next
/// field counts fixed-size strides, so every step moves forward and the walk
/// is bounded by the window size.
fn walk_chain<W: Window>(
    chain: W,
    pointer_format: u16,
    segment_index: u32,
    start_in_segment: u64,
    imports: &[Import],
    rebases: &mut Vec<Rebase>,
    binds: &mut Vec<Bind>,
) -> crate::Result<()> {
    let stride: u64 = match pointer_format {
        DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => 4,
        DYLD_CHAINED_PTR_ARM64E_USERLAND24 => 8,
        other => {
            warn!("unsupported pointer format {other}, skipping chain");
            return Ok(());
        }
    };

    let mut offset_in_segment = start_in_segment;
    let mut reader = chain;
    loop {
        let raw = reader.read_u64()?;
        let next = match pointer_format {
            DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => decode_ptr64(
                raw,
                pointer_format,
                segment_index,
                offset_in_segment,
                imports,
                rebases,
                binds,
            ),
            _ => decode_arm64e(raw, segment_index, offset_in_segment, imports, rebases, binds),
        };
        if next == 0 {
            break;
        }
        offset_in_segment += next * stride;
        reader = reader.base_reader()?.child_from(next * stride)?;
    }
    Ok(())
}

/// Decodes one DYLD_CHAINED_PTR_64 / DYLD_CHAINED_PTR_64_OFFSET record and
/// returns its next-stride count.
///
/// Bind layout: ordinal in bits 0-23, addend 24-31, next 51-62, bind bit 63.
/// Rebase layout: target in bits 0-35, high8 36-43, next 51-62, bind bit 63.
/// The two formats differ in the rebase target: PTR_64 carries the authored
/// virtual address, PTR_64_OFFSET an offset from the load base with high8
/// folded in before the slide is added.
fn decode_ptr64(
    raw: u64,
    pointer_format: u16,
    segment_index: u32,
    offset_in_segment: u64,
    imports: &[Import],
    rebases: &mut Vec<Rebase>,
    binds: &mut Vec<Bind>,
) -> u64 {
    let next = (raw >> 51) & 0xfff;
    if raw >> 63 == 1 {
        let ordinal = raw & 0xff_ffff;
        push_bind(ordinal, segment_index, offset_in_segment, imports, binds);
    } else {
        let target = raw & 0xf_ffff_ffff;
        let high8 = (raw >> 36) & 0xff;
        let target = if pointer_format == DYLD_CHAINED_PTR_64 {
            target
        } else {
            (high8 << 36) | target
        };
        trace!(offset_in_segment, target, "rebase");
        rebases.push(Rebase {
            segment_index,
            offset_in_segment,
            target,
        });
    }
    next
}

/// Decodes one DYLD_CHAINED_PTR_ARM64E_USERLAND24 record and returns its
/// next-stride count.
///
/// Bit 63 selects the sub-layout. Both carry a 24-bit ordinal in the low
/// bits, next in bits 51-61 and the bind flag in bit 62; the authenticated
/// form additionally packs diversity (32-47), the address-diversity flag
/// (48) and the key (49-50).
fn decode_arm64e(
    raw: u64,
    segment_index: u32,
    offset_in_segment: u64,
    imports: &[Import],
    rebases: &mut Vec<Rebase>,
    binds: &mut Vec<Bind>,
) -> u64 {
    let next = (raw >> 51) & 0x7ff;
    let is_bind = (raw >> 62) & 0x1 == 1;
    if raw >> 63 == 0 {
        let diversity = (raw >> 32) & 0xffff;
        let addr_div = (raw >> 48) & 0x1;
        let key = (raw >> 49) & 0x3;
        trace!(diversity, addr_div, key, "authenticated pointer");
    }
    if is_bind {
        let ordinal = raw & 0xff_ffff;
        push_bind(ordinal, segment_index, offset_in_segment, imports, binds);
    } else {
        let target = raw & 0xff_ffff;
        trace!(offset_in_segment, target, "rebase");
        rebases.push(Rebase {
            segment_index,
            offset_in_segment,
            target,
        });
    }
    next
}

fn push_bind(
    ordinal: u64,
    segment_index: u32,
    offset_in_segment: u64,
    imports: &[Import],
    binds: &mut Vec<Bind>,
) {
    // Corrupt chains have been seen in the wild with wild ordinals; skip the
    // record and keep walking rather than abort the image.
    let Some(import) = imports.get(ordinal as usize) else {
        warn!(ordinal, "bind ordinal out of range, skipping");
        return;
    };
    debug!(
        offset_in_segment,
        ordinal = import.lib_ordinal,
        name = %import.name,
        "bind"
    );
    binds.push(Bind {
        segment_index,
        offset_in_segment,
        lib_ordinal: import.lib_ordinal,
        weak: import.weak,
        symbol_name: import.name.clone(),
    });
}
