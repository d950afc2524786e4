//! Index XML encode/decode.
//!
//! The codec round-trips the logical index structure: chain metadata,
//! placement criteria, the dentry tree with extents and extended
//! attributes, and any index-level elements this version does not
//! recognize (kept verbatim so a newer writer's tags survive a rewrite).

use crate::error::{LtfsError, Result};
use crate::index::types::{
    Dentry, DentryData, DentryTimes, Extent, Index, IndexCriteria, TapePtr, XAttr,
    INDEX_CREATOR,
};
use crate::util::time::LtfsTime;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::sync::Arc;
use tracing::{debug, warn};

// --- serialization --------------------------------------------------------

pub fn serialize(index: &Index) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;

    let mut root = BytesStart::new("ltfsindex");
    root.push_attribute(("version", index.version.as_str()));
    writer.write_event(Event::Start(root)).map_err(xml_err)?;

    text_el(&mut writer, "creator", &index.creator)?;
    text_el(&mut writer, "volumeuuid", &index.vol_uuid)?;
    text_el(&mut writer, "generationnumber", &index.generation.to_string())?;
    text_el(&mut writer, "updatetime", &index.mod_time.format())?;
    if let Some(selfptr) = &index.selfptr {
        location_el(&mut writer, "location", selfptr)?;
    }
    if let Some(backptr) = &index.backptr {
        location_el(&mut writer, "previousgenerationlocation", backptr)?;
    }
    text_el(
        &mut writer,
        "allowpolicyupdate",
        bool_str(index.criteria.allow_update),
    )?;
    if index.criteria.max_filesize > 0 || !index.criteria.glob_patterns.is_empty() {
        writer
            .write_event(Event::Start(BytesStart::new("dataplacementpolicy")))
            .map_err(xml_err)?;
        writer
            .write_event(Event::Start(BytesStart::new("indexpartitioncriteria")))
            .map_err(xml_err)?;
        text_el(
            &mut writer,
            "size",
            &index.criteria.max_filesize.to_string(),
        )?;
        for pattern in &index.criteria.glob_patterns {
            text_el(&mut writer, "name", pattern)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("indexpartitioncriteria")))
            .map_err(xml_err)?;
        writer
            .write_event(Event::End(BytesEnd::new("dataplacementpolicy")))
            .map_err(xml_err)?;
    }
    if let Some(name) = &index.volume_name {
        text_el(&mut writer, "volumename", name)?;
    }
    if let Some(msg) = &index.commit_message {
        text_el(&mut writer, "comment", msg)?;
    }
    text_el(&mut writer, "highestfileuid", &index.highest_uid.to_string())?;
    for raw in &index.preserved_tags {
        // Already well-formed markup; write through unescaped.
        writer
            .write_event(Event::Text(BytesText::from_escaped(raw.as_str())))
            .map_err(xml_err)?;
    }

    write_directory(&mut writer, &index.root)?;

    writer
        .write_event(Event::End(BytesEnd::new("ltfsindex")))
        .map_err(xml_err)?;

    let bytes = writer.into_inner();
    String::from_utf8(bytes).map_err(|e| LtfsError::parse(e.to_string()))
}

fn xml_err(e: quick_xml::Error) -> LtfsError {
    LtfsError::parse(e.to_string())
}

fn bool_str(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

fn text_el(writer: &mut Writer<Vec<u8>>, tag: &str, value: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::Text(BytesText::new(value)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(xml_err)?;
    Ok(())
}

fn location_el(writer: &mut Writer<Vec<u8>>, tag: &str, ptr: &TapePtr) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .map_err(xml_err)?;
    text_el(writer, "partition", &ptr.partition.to_string())?;
    text_el(writer, "startblock", &ptr.block.to_string())?;
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(xml_err)?;
    Ok(())
}

fn write_times(writer: &mut Writer<Vec<u8>>, times: &DentryTimes) -> Result<()> {
    text_el(writer, "creationtime", &times.creation.format())?;
    text_el(writer, "changetime", &times.change.format())?;
    text_el(writer, "modifytime", &times.modify.format())?;
    text_el(writer, "accesstime", &times.access.format())?;
    text_el(writer, "backuptime", &times.backup.format())?;
    Ok(())
}

fn write_xattrs(writer: &mut Writer<Vec<u8>>, xattrs: &[XAttr]) -> Result<()> {
    if xattrs.is_empty() {
        return Ok(());
    }
    writer
        .write_event(Event::Start(BytesStart::new("extendedattributes")))
        .map_err(xml_err)?;
    for xattr in xattrs {
        writer
            .write_event(Event::Start(BytesStart::new("xattr")))
            .map_err(xml_err)?;
        text_el(writer, "key", &xattr.name)?;
        match std::str::from_utf8(&xattr.value) {
            Ok(text) if !text.contains('\0') => text_el(writer, "value", text)?,
            _ => {
                let mut value = BytesStart::new("value");
                value.push_attribute(("type", "base64"));
                writer.write_event(Event::Start(value)).map_err(xml_err)?;
                writer
                    .write_event(Event::Text(BytesText::new(&BASE64.encode(&xattr.value))))
                    .map_err(xml_err)?;
                writer
                    .write_event(Event::End(BytesEnd::new("value")))
                    .map_err(xml_err)?;
            }
        }
        writer
            .write_event(Event::End(BytesEnd::new("xattr")))
            .map_err(xml_err)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("extendedattributes")))
        .map_err(xml_err)?;
    Ok(())
}

fn write_directory(writer: &mut Writer<Vec<u8>>, dir: &Arc<Dentry>) -> Result<()> {
    let meta = dir.meta.read().clone();
    writer
        .write_event(Event::Start(BytesStart::new("directory")))
        .map_err(xml_err)?;
    text_el(writer, "name", &meta.name)?;
    text_el(writer, "readonly", bool_str(meta.readonly))?;
    if meta.immutable {
        text_el(writer, "immutable", "true")?;
    }
    if meta.appendonly {
        text_el(writer, "appendonly", "true")?;
    }
    write_times(writer, &meta.times)?;
    text_el(writer, "fileuid", &dir.uid.to_string())?;
    write_xattrs(writer, &meta.xattrs)?;

    writer
        .write_event(Event::Start(BytesStart::new("contents")))
        .map_err(xml_err)?;
    for child in dir.children_by_uid() {
        if child.isdir {
            write_directory(writer, &child)?;
        } else {
            write_file(writer, &child)?;
        }
    }
    writer
        .write_event(Event::End(BytesEnd::new("contents")))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("directory")))
        .map_err(xml_err)?;
    Ok(())
}

fn write_file(writer: &mut Writer<Vec<u8>>, file: &Arc<Dentry>) -> Result<()> {
    let meta = file.meta.read().clone();
    writer
        .write_event(Event::Start(BytesStart::new("file")))
        .map_err(xml_err)?;
    text_el(writer, "name", &meta.name)?;
    text_el(writer, "length", &meta.size.to_string())?;
    text_el(writer, "readonly", bool_str(meta.readonly))?;
    if meta.immutable {
        text_el(writer, "immutable", "true")?;
    }
    if meta.appendonly {
        text_el(writer, "appendonly", "true")?;
    }
    write_times(writer, &meta.times)?;
    text_el(writer, "fileuid", &file.uid.to_string())?;
    if let Some(target) = file.symlink_target() {
        text_el(writer, "symlink", &target)?;
    }
    let extents = file.extents();
    if !extents.is_empty() {
        writer
            .write_event(Event::Start(BytesStart::new("extentinfo")))
            .map_err(xml_err)?;
        for ext in &extents {
            writer
                .write_event(Event::Start(BytesStart::new("extent")))
                .map_err(xml_err)?;
            text_el(writer, "fileoffset", &ext.file_offset.to_string())?;
            text_el(writer, "partition", &ext.partition.to_string())?;
            text_el(writer, "startblock", &ext.start_block.to_string())?;
            text_el(writer, "byteoffset", &ext.byte_offset.to_string())?;
            text_el(writer, "bytecount", &ext.byte_count.to_string())?;
            writer
                .write_event(Event::End(BytesEnd::new("extent")))
                .map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("extentinfo")))
            .map_err(xml_err)?;
    }
    write_xattrs(writer, &meta.xattrs)?;
    writer
        .write_event(Event::End(BytesEnd::new("file")))
        .map_err(xml_err)?;
    Ok(())
}

// --- parsing --------------------------------------------------------------

pub fn parse(xml: &str) -> Result<Index> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) if e.local_name().as_ref() == b"ltfsindex" => {
                let mut version = String::new();
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"version" {
                        version = String::from_utf8_lossy(&attr.value).into_owned();
                    }
                }
                Index::check_version(&version)?;
                return parse_index_body(&mut reader, version);
            }
            Event::Decl(_) | Event::Comment(_) | Event::Text(_) => continue,
            Event::Eof => return Err(LtfsError::parse("no ltfsindex element")),
            _ => continue,
        }
    }
}

fn read_text(reader: &mut Reader<&[u8]>, tag: &BytesStart) -> Result<String> {
    let end = tag.to_end().into_owned();
    let text = reader.read_text(end.name()).map_err(xml_err)?;
    Ok(text.into_owned())
}

fn parse_time(text: &str) -> LtfsTime {
    match LtfsTime::parse(text) {
        Some(t) => t,
        None => {
            warn!("unparsable timestamp '{}', clamping to epoch", text);
            LtfsTime::EPOCH
        }
    }
}

fn parse_bool(text: &str) -> bool {
    matches!(text.trim(), "true" | "1")
}

/// Reconstruct an unrecognized element (markup included) so it can be
/// written back verbatim.
fn capture_raw(reader: &mut Reader<&[u8]>, start: &BytesStart) -> Result<String> {
    fn start_text(e: &BytesStart) -> String {
        let mut s = String::from("<");
        s.push_str(&String::from_utf8_lossy(e.name().as_ref()));
        for attr in e.attributes().flatten() {
            s.push(' ');
            s.push_str(&String::from_utf8_lossy(attr.key.as_ref()));
            s.push_str("=\"");
            s.push_str(&String::from_utf8_lossy(&attr.value));
            s.push('"');
        }
        s.push('>');
        s
    }

    let mut raw = start_text(start);
    let mut depth = 1usize;
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                depth += 1;
                raw.push_str(&start_text(&e));
            }
            Event::Empty(e) => {
                let mut s = start_text(&e);
                s.pop();
                s.push_str("/>");
                raw.push_str(&s);
            }
            Event::Text(t) => {
                raw.push_str(&String::from_utf8_lossy(t.as_ref()));
            }
            Event::End(e) => {
                raw.push_str("</");
                raw.push_str(&String::from_utf8_lossy(e.name().as_ref()));
                raw.push('>');
                depth -= 1;
                if depth == 0 {
                    return Ok(raw);
                }
            }
            Event::Eof => return Err(LtfsError::parse("unterminated element")),
            _ => {}
        }
    }
}

fn parse_location(reader: &mut Reader<&[u8]>, outer: &BytesStart) -> Result<TapePtr> {
    let mut partition = '\0';
    let mut block = 0u64;
    let outer_name = outer.name().as_ref().to_vec();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                let text = read_text(reader, &e)?;
                match name.as_slice() {
                    b"partition" => partition = text.chars().next().unwrap_or('\0'),
                    b"startblock" => {
                        block = text.trim().parse().map_err(|_| {
                            LtfsError::parse(format!("bad startblock '{}'", text))
                        })?
                    }
                    _ => {}
                }
            }
            Event::End(e) if e.name().as_ref() == outer_name.as_slice() => break,
            Event::Eof => return Err(LtfsError::parse("unterminated location")),
            _ => {}
        }
    }
    Ok(TapePtr::new(partition, block))
}

fn parse_criteria(reader: &mut Reader<&[u8]>) -> Result<IndexCriteria> {
    let mut criteria = IndexCriteria::default();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"indexpartitioncriteria" => continue,
                    b"size" => {
                        let text = read_text(reader, &e)?;
                        criteria.max_filesize = text.trim().parse().unwrap_or(0);
                    }
                    b"name" => {
                        let text = read_text(reader, &e)?;
                        criteria.glob_patterns.push(text);
                    }
                    _ => {
                        let _ = capture_raw(reader, &e)?;
                    }
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"dataplacementpolicy" => break,
            Event::Eof => return Err(LtfsError::parse("unterminated dataplacementpolicy")),
            _ => {}
        }
    }
    Ok(criteria)
}

fn parse_xattrs(reader: &mut Reader<&[u8]>) -> Result<Vec<XAttr>> {
    let mut xattrs = Vec::new();
    let mut key: Option<String> = None;
    let mut value: Option<Vec<u8>> = None;
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"xattr" => {
                        key = None;
                        value = None;
                    }
                    b"key" => key = Some(read_text(reader, &e)?),
                    b"value" => {
                        let mut base64_encoded = false;
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"type" && attr.value.as_ref() == b"base64" {
                                base64_encoded = true;
                            }
                        }
                        let text = read_text(reader, &e)?;
                        value = Some(if base64_encoded {
                            BASE64
                                .decode(text.trim())
                                .map_err(|e| LtfsError::parse(format!("xattr base64: {}", e)))?
                        } else {
                            text.into_bytes()
                        });
                    }
                    _ => {
                        let _ = capture_raw(reader, &e)?;
                    }
                }
            }
            Event::Empty(e) if e.local_name().as_ref() == b"value" => {
                value = Some(Vec::new());
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"xattr" => {
                    if let Some(name) = key.take() {
                        xattrs.push(XAttr {
                            name,
                            value: value.take().unwrap_or_default(),
                        });
                    }
                }
                b"extendedattributes" => break,
                _ => {}
            },
            Event::Eof => return Err(LtfsError::parse("unterminated extendedattributes")),
            _ => {}
        }
    }
    Ok(xattrs)
}

struct ParseStats {
    file_count: u64,
    max_uid: u64,
}

fn parse_index_body(reader: &mut Reader<&[u8]>, version: String) -> Result<Index> {
    let now = LtfsTime::now();
    let mut index = Index::new_empty("", now);
    index.version = version;
    index.creator = INDEX_CREATOR.to_string();
    let mut stats = ParseStats {
        file_count: 0,
        max_uid: 1,
    };
    let mut highest_uid_tag: Option<u64> = None;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"creator" => index.creator = read_text(reader, &e)?,
                    b"volumeuuid" => index.vol_uuid = read_text(reader, &e)?,
                    b"generationnumber" => {
                        let text = read_text(reader, &e)?;
                        index.generation = text.trim().parse().map_err(|_| {
                            LtfsError::parse(format!("bad generation '{}'", text))
                        })?;
                    }
                    b"updatetime" => index.mod_time = parse_time(&read_text(reader, &e)?),
                    b"location" => index.selfptr = Some(parse_location(reader, &e)?),
                    b"previousgenerationlocation" => {
                        index.backptr = Some(parse_location(reader, &e)?)
                    }
                    b"allowpolicyupdate" => {
                        index.criteria.allow_update = parse_bool(&read_text(reader, &e)?)
                    }
                    b"dataplacementpolicy" => {
                        let allow = index.criteria.allow_update;
                        index.criteria = parse_criteria(reader)?;
                        index.criteria.allow_update = allow;
                    }
                    b"volumename" => index.volume_name = Some(read_text(reader, &e)?),
                    b"comment" => index.commit_message = Some(read_text(reader, &e)?),
                    b"highestfileuid" => {
                        let text = read_text(reader, &e)?;
                        highest_uid_tag = text.trim().parse().ok();
                    }
                    b"directory" => {
                        let root = parse_directory(reader, &mut stats)?;
                        index.root = root;
                    }
                    _ => index.preserved_tags.push(capture_raw(reader, &e)?),
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"ltfsindex" => break,
            Event::Eof => return Err(LtfsError::parse("unterminated ltfsindex")),
            _ => {}
        }
    }

    if index.vol_uuid.is_empty() {
        return Err(LtfsError::parse("index has no volumeuuid"));
    }
    index.file_count = stats.file_count;
    index.highest_uid = highest_uid_tag.unwrap_or(stats.max_uid).max(stats.max_uid);
    index.dirty = false;
    debug!(
        "parsed index generation {} ({} files, highest uid {})",
        index.generation, index.file_count, index.highest_uid
    );
    Ok(index)
}

#[derive(Default)]
struct EntryFields {
    name: String,
    readonly: bool,
    immutable: bool,
    appendonly: bool,
    uid: u64,
    length: u64,
    times: Option<DentryTimes>,
    xattrs: Vec<XAttr>,
    symlink: Option<String>,
    extents: Vec<Extent>,
}

fn times_or_epoch(fields: &EntryFields) -> DentryTimes {
    fields
        .times
        .unwrap_or_else(|| DentryTimes::all(LtfsTime::EPOCH))
}

fn apply_common_field(
    reader: &mut Reader<&[u8]>,
    e: &BytesStart,
    fields: &mut EntryFields,
) -> Result<bool> {
    let name = e.local_name().as_ref().to_vec();
    let mut times = fields.times.unwrap_or_else(|| DentryTimes::all(LtfsTime::EPOCH));
    match name.as_slice() {
        b"name" => fields.name = read_text(reader, e)?,
        b"readonly" => fields.readonly = parse_bool(&read_text(reader, e)?),
        b"immutable" => fields.immutable = parse_bool(&read_text(reader, e)?),
        b"appendonly" => fields.appendonly = parse_bool(&read_text(reader, e)?),
        b"fileuid" => {
            let text = read_text(reader, e)?;
            fields.uid = text.trim().parse().unwrap_or(0);
        }
        b"length" => {
            let text = read_text(reader, e)?;
            fields.length = text.trim().parse().unwrap_or(0);
        }
        b"creationtime" => {
            times.creation = parse_time(&read_text(reader, e)?);
            fields.times = Some(times);
        }
        b"changetime" => {
            times.change = parse_time(&read_text(reader, e)?);
            fields.times = Some(times);
        }
        b"modifytime" => {
            times.modify = parse_time(&read_text(reader, e)?);
            fields.times = Some(times);
        }
        b"accesstime" => {
            times.access = parse_time(&read_text(reader, e)?);
            fields.times = Some(times);
        }
        b"backuptime" => {
            times.backup = parse_time(&read_text(reader, e)?);
            fields.times = Some(times);
        }
        b"extendedattributes" => fields.xattrs = parse_xattrs(reader)?,
        b"symlink" => fields.symlink = Some(read_text(reader, e)?),
        _ => return Ok(false),
    }
    Ok(true)
}

fn parse_directory(reader: &mut Reader<&[u8]>, stats: &mut ParseStats) -> Result<Arc<Dentry>> {
    let mut fields = EntryFields::default();
    let mut children: Vec<Arc<Dentry>> = Vec::new();

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"contents" => {
                        children = parse_contents(reader, stats)?;
                    }
                    _ => {
                        if !apply_common_field(reader, &e, &mut fields)? {
                            let _ = capture_raw(reader, &e)?;
                        }
                    }
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"directory" => break,
            Event::Eof => return Err(LtfsError::parse("unterminated directory")),
            _ => {}
        }
    }

    if fields.uid == 0 {
        return Err(LtfsError::parse(format!(
            "directory '{}' has no fileuid",
            fields.name
        )));
    }
    stats.max_uid = stats.max_uid.max(fields.uid);

    let dir = Dentry::new_dir(fields.uid, &fields.name, LtfsTime::EPOCH);
    {
        let mut meta = dir.meta.write();
        meta.readonly = fields.readonly;
        meta.immutable = fields.immutable;
        meta.appendonly = fields.appendonly;
        meta.times = times_or_epoch(&fields);
        meta.xattrs = fields.xattrs;
        meta.dirty = false;
    }
    for child in children {
        dir.attach_child(&child)?;
    }
    Ok(dir)
}

fn parse_contents(
    reader: &mut Reader<&[u8]>,
    stats: &mut ParseStats,
) -> Result<Vec<Arc<Dentry>>> {
    let mut children = Vec::new();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"directory" => children.push(parse_directory(reader, stats)?),
                    b"file" => children.push(parse_file(reader, stats)?),
                    _ => {
                        let _ = capture_raw(reader, &e)?;
                    }
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"contents" => break,
            Event::Eof => return Err(LtfsError::parse("unterminated contents")),
            _ => {}
        }
    }
    Ok(children)
}

fn parse_extents(reader: &mut Reader<&[u8]>) -> Result<Vec<Extent>> {
    let mut extents = Vec::new();
    let mut current: Option<Extent> = None;
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"extent" => {
                        current = Some(Extent {
                            partition: '\0',
                            start_block: 0,
                            byte_offset: 0,
                            byte_count: 0,
                            file_offset: 0,
                        });
                    }
                    b"fileoffset" | b"partition" | b"startblock" | b"byteoffset"
                    | b"bytecount" => {
                        let text = read_text(reader, &e)?;
                        if let Some(ext) = current.as_mut() {
                            match name.as_slice() {
                                b"fileoffset" => {
                                    ext.file_offset = text.trim().parse().unwrap_or(0)
                                }
                                b"partition" => {
                                    ext.partition = text.chars().next().unwrap_or('\0')
                                }
                                b"startblock" => {
                                    ext.start_block = text.trim().parse().unwrap_or(0)
                                }
                                b"byteoffset" => {
                                    ext.byte_offset = text.trim().parse().unwrap_or(0)
                                }
                                b"bytecount" => {
                                    ext.byte_count = text.trim().parse().unwrap_or(0)
                                }
                                _ => {}
                            }
                        }
                    }
                    _ => {
                        let _ = capture_raw(reader, &e)?;
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"extent" => {
                    if let Some(ext) = current.take() {
                        extents.push(ext);
                    }
                }
                b"extentinfo" => break,
                _ => {}
            },
            Event::Eof => return Err(LtfsError::parse("unterminated extentinfo")),
            _ => {}
        }
    }
    extents.sort_by_key(|e| e.file_offset);
    Ok(extents)
}

fn parse_file(reader: &mut Reader<&[u8]>, stats: &mut ParseStats) -> Result<Arc<Dentry>> {
    let mut fields = EntryFields::default();

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"extentinfo" => fields.extents = parse_extents(reader)?,
                    _ => {
                        if !apply_common_field(reader, &e, &mut fields)? {
                            let _ = capture_raw(reader, &e)?;
                        }
                    }
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"file" => break,
            Event::Eof => return Err(LtfsError::parse("unterminated file")),
            _ => {}
        }
    }

    if fields.uid == 0 {
        return Err(LtfsError::parse(format!(
            "file '{}' has no fileuid",
            fields.name
        )));
    }
    stats.max_uid = stats.max_uid.max(fields.uid);
    stats.file_count += 1;

    let dentry = match &fields.symlink {
        Some(target) => Dentry::new_symlink(fields.uid, &fields.name, target, LtfsTime::EPOCH),
        None => Dentry::new_file(fields.uid, &fields.name, fields.readonly, LtfsTime::EPOCH),
    };
    {
        let mut meta = dentry.meta.write();
        meta.readonly = fields.readonly;
        meta.immutable = fields.immutable;
        meta.appendonly = fields.appendonly;
        meta.times = times_or_epoch(&fields);
        meta.xattrs = fields.xattrs;
        meta.size = fields.length;
        meta.realsize = fields.extents.iter().map(|e| e.byte_count).sum();
        meta.dirty = false;
    }
    if !fields.extents.is_empty() {
        if let DentryData::File { extents } = &mut *dentry.contents.write() {
            *extents = fields.extents;
        }
    }
    Ok(dentry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::types::insert_extent;

    fn build_sample() -> Index {
        let now = LtfsTime::new(1_700_000_000, 0);
        let mut index = Index::new_empty("11111111-2222-3333-4444-555555555555", now);
        index.generation = 3;
        index.selfptr = Some(TapePtr::new('a', 5));
        index.backptr = Some(TapePtr::new('b', 4));
        index.volume_name = Some("archive01".to_string());
        index.commit_message = Some("nightly snapshot".to_string());
        index.criteria = IndexCriteria {
            max_filesize: 1048576,
            glob_patterns: vec!["*.xml".to_string()],
            allow_update: true,
        };

        let dir = Dentry::new_dir(2, "docs", now);
        index.root.attach_child(&dir).unwrap();

        let file = Dentry::new_file(3, "a.txt", false, now);
        {
            let mut meta = file.meta.write();
            meta.size = 32;
            meta.realsize = 32;
            meta.xattrs.push(XAttr {
                name: "user.color".to_string(),
                value: b"blue".to_vec(),
            });
            meta.xattrs.push(XAttr {
                name: "user.blob".to_string(),
                value: vec![0, 159, 146, 150],
            });
        }
        if let DentryData::File { extents } = &mut *file.contents.write() {
            insert_extent(
                extents,
                Extent {
                    partition: 'b',
                    start_block: 4,
                    byte_offset: 0,
                    byte_count: 32,
                    file_offset: 0,
                },
                524288,
            );
        }
        dir.attach_child(&file).unwrap();

        let link = Dentry::new_symlink(4, "link", "/docs/a.txt", now);
        index.root.attach_child(&link).unwrap();

        index.highest_uid = 4;
        index.file_count = 2;
        index
    }

    #[test]
    fn round_trip_preserves_structure() {
        let index = build_sample();
        let xml = serialize(&index).unwrap();
        let parsed = parse(&xml).unwrap();

        assert_eq!(parsed.generation, 3);
        assert_eq!(parsed.vol_uuid, index.vol_uuid);
        assert_eq!(parsed.selfptr, index.selfptr);
        assert_eq!(parsed.backptr, index.backptr);
        assert_eq!(parsed.volume_name, index.volume_name);
        assert_eq!(parsed.commit_message, index.commit_message);
        assert_eq!(parsed.criteria, index.criteria);
        assert_eq!(parsed.file_count, 2);
        assert_eq!(parsed.highest_uid, 4);

        let docs = parsed.root.lookup("docs").expect("docs");
        let file = docs.lookup("a.txt").expect("a.txt");
        let meta = file.meta.read();
        assert_eq!(meta.size, 32);
        assert_eq!(meta.realsize, 32);
        assert_eq!(meta.xattr("user.color").unwrap().value, b"blue");
        assert_eq!(meta.xattr("user.blob").unwrap().value, vec![0, 159, 146, 150]);
        drop(meta);
        let extents = file.extents();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].start_block, 4);
        assert_eq!(extents[0].byte_count, 32);

        let link = parsed.root.lookup("link").expect("link");
        assert!(link.isslink);
        assert_eq!(link.symlink_target().unwrap(), "/docs/a.txt");

        // Serialize again: stable output.
        let xml2 = serialize(&parsed).unwrap();
        assert_eq!(xml, xml2);
    }

    #[test]
    fn unknown_tags_survive() {
        let index = build_sample();
        let mut xml = serialize(&index).unwrap();
        xml = xml.replace(
            "<highestfileuid>",
            "<futurefeature mode=\"x\"><inner>keep me</inner></futurefeature><highestfileuid>",
        );
        let parsed = parse(&xml).unwrap();
        assert_eq!(parsed.preserved_tags.len(), 1);
        assert!(parsed.preserved_tags[0].contains("keep me"));
        let xml2 = serialize(&parsed).unwrap();
        assert!(xml2.contains("<futurefeature mode=\"x\"><inner>keep me</inner></futurefeature>"));
    }

    #[test]
    fn unsupported_version_rejected() {
        let xml = "<?xml version=\"1.0\"?><ltfsindex version=\"3.0.0\"></ltfsindex>";
        assert!(matches!(
            parse(xml),
            Err(LtfsError::UnsupportedIndexVersion(_))
        ));
    }

    #[test]
    fn missing_uuid_rejected() {
        let xml = "<?xml version=\"1.0\"?><ltfsindex version=\"2.4.0\">\
                   <generationnumber>1</generationnumber></ltfsindex>";
        assert!(parse(xml).is_err());
    }
}
