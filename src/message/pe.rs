//! `RT_MESSAGETABLE` resource extraction from PE images (via `goblin`).
//!
//! Message DLLs and EXEs carry their tables as resources of type 11. Only the header, the section
//! table and the resource directory are parsed, so this works on any platform and on minimal
//! images that stricter PE parsers reject.

use crate::err::MessageFileError;
use crate::utils::bytes;

use goblin::pe::header;
use goblin::pe::options::ParseOptions;
use goblin::pe::resource::{ImageResourceDirectory, ResourceDataEntry, ResourceEntry};
use goblin::pe::section_table::SectionTable;

/// `RT_MESSAGETABLE`.
pub const RT_MESSAGETABLE: u32 = 11;

const IMAGE_RESOURCE_DIRECTORY_HEADER_SIZE: usize = 16;
const RESOURCE_DATA_ENTRY_SIZE: usize = 16;

/// One `RT_MESSAGETABLE` resource in one language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTableResource {
    pub resource_id: u32,
    pub lang_id: u32,
    pub data: Vec<u8>,
}

fn malformed_resource(message: &'static str) -> MessageFileError {
    MessageFileError::MalformedResource { message }
}

fn rva_to_file_offset(
    sections: &[SectionTable],
    file_alignment: u32,
    opts: &ParseOptions,
    rva: u32,
) -> Option<usize> {
    goblin::pe::utils::find_offset(rva as usize, sections, file_alignment, opts)
}

fn parse_image_resource_directory(
    rsrc: &[u8],
    offset: usize,
) -> Result<ImageResourceDirectory, MessageFileError> {
    if offset + IMAGE_RESOURCE_DIRECTORY_HEADER_SIZE > rsrc.len() {
        return Err(malformed_resource("resource directory header out of bounds"));
    }
    let u16_at = |at: usize| {
        bytes::read_u16_le(rsrc, offset + at)
            .ok_or_else(|| malformed_resource("resource directory field out of bounds"))
    };
    let u32_at = |at: usize| {
        bytes::read_u32_le(rsrc, offset + at)
            .ok_or_else(|| malformed_resource("resource directory field out of bounds"))
    };

    Ok(ImageResourceDirectory {
        characteristics: u32_at(0)?,
        time_date_stamp: u32_at(4)?,
        major_version: u16_at(8)?,
        minor_version: u16_at(10)?,
        number_of_named_entries: u16_at(12)?,
        number_of_id_entries: u16_at(14)?,
    })
}

fn directory_entries(
    rsrc: &[u8],
    dir_offset: usize,
) -> Result<Vec<ResourceEntry>, MessageFileError> {
    let dir = parse_image_resource_directory(rsrc, dir_offset)?;
    let entries_offset = dir_offset
        .checked_add(IMAGE_RESOURCE_DIRECTORY_HEADER_SIZE)
        .ok_or_else(|| malformed_resource("resource directory entries offset overflow"))?;

    let it = dir
        .next_iter(entries_offset, rsrc)
        .map_err(|_| malformed_resource("resource directory entries out of bounds"))?;

    it.collect::<Result<Vec<_>, _>>()
        .map_err(|_| malformed_resource("failed to parse resource directory entries"))
}

fn parse_resource_data_entry(
    rsrc: &[u8],
    offset: usize,
) -> Result<ResourceDataEntry, MessageFileError> {
    if offset + RESOURCE_DATA_ENTRY_SIZE > rsrc.len() {
        return Err(malformed_resource("resource data entry out of bounds"));
    }
    let u32_at = |at: usize| {
        bytes::read_u32_le(rsrc, offset + at)
            .ok_or_else(|| malformed_resource("resource data entry field out of bounds"))
    };

    Ok(ResourceDataEntry {
        offset_to_data: u32_at(0)?,
        size: u32_at(4)?,
        code_page: u32_at(8)?,
        reserved: u32_at(12)?,
    })
}

/// Extract every `RT_MESSAGETABLE` resource of a PE image.
///
/// Named resources are skipped (message tables always use numeric ids). Returns an empty vector
/// when the image has no resources or no message tables.
pub fn extract_message_table_resources(
    pe_bytes: &[u8],
) -> Result<Vec<MessageTableResource>, MessageFileError> {
    let header = header::Header::parse(pe_bytes).map_err(|_| MessageFileError::InvalidPe {
        message: "failed to parse PE via goblin",
    })?;

    let Some(optional_header) = header.optional_header else {
        return Err(MessageFileError::InvalidPe {
            message: "missing optional header",
        });
    };

    let Some(resource_table) = optional_header.data_directories.get_resource_table() else {
        return Ok(Vec::new());
    };
    if resource_table.virtual_address == 0 || resource_table.size == 0 {
        return Ok(Vec::new());
    }

    let file_alignment = optional_header.windows_fields.file_alignment;
    let opts = ParseOptions::default();

    let optional_header_offset = header.dos_header.pe_pointer as usize
        + header::SIZEOF_PE_MAGIC
        + header::SIZEOF_COFF_HEADER;
    let mut sections_offset =
        optional_header_offset + header.coff_header.size_of_optional_header as usize;
    let sections = header
        .coff_header
        .sections(pe_bytes, &mut sections_offset)
        .map_err(|_| MessageFileError::MalformedPe {
            message: "failed to parse section headers",
        })?;

    let rsrc_offset = rva_to_file_offset(
        &sections,
        file_alignment,
        &opts,
        resource_table.virtual_address,
    )
    .ok_or(MessageFileError::UnmappedRva {
        rva: resource_table.virtual_address,
    })?;
    let rsrc = rsrc_offset
        .checked_add(resource_table.size as usize)
        .and_then(|end| pe_bytes.get(rsrc_offset..end))
        .ok_or(MessageFileError::MalformedPe {
            message: "resource directory out of bounds",
        })?;

    let Some(type_entry) = directory_entries(rsrc, 0)?
        .into_iter()
        .find(|e| !e.name_is_string() && e.name_offset() == RT_MESSAGETABLE)
    else {
        return Ok(Vec::new());
    };
    if !type_entry.data_is_directory() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();

    for resource_entry in directory_entries(rsrc, type_entry.offset_to_directory() as usize)? {
        if resource_entry.name_is_string() || !resource_entry.data_is_directory() {
            continue;
        }
        let resource_id = resource_entry.name_offset();

        let lang_dir_offset = resource_entry.offset_to_directory() as usize;
        for lang_entry in directory_entries(rsrc, lang_dir_offset)? {
            if lang_entry.name_is_string() {
                continue;
            }
            let lang_id = lang_entry.name_offset();

            let Some(data_entry_offset) = lang_entry.offset_to_data() else {
                continue;
            };
            let data_entry = parse_resource_data_entry(rsrc, data_entry_offset as usize)?;
            let data_rva = data_entry.offset_to_data;
            let data_size = data_entry.size as usize;
            if data_size == 0 {
                continue;
            }

            let data_offset = rva_to_file_offset(&sections, file_alignment, &opts, data_rva)
                .ok_or(MessageFileError::UnmappedRva { rva: data_rva })?;
            let data = data_offset
                .checked_add(data_size)
                .and_then(|end| pe_bytes.get(data_offset..end))
                .ok_or(MessageFileError::MalformedPe {
                    message: "resource data out of bounds",
                })?
                .to_vec();

            out.push(MessageTableResource {
                resource_id,
                lang_id,
                data,
            });
        }
    }

    Ok(out)
}
