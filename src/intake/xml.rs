//! Fixed-shape decoding of camera detection messages.
//!
//! Cameras post an XML document with the fields of interest nested at
//! varying depths. Only five element names are read; everything else is
//! ignored. The first non-empty value of each wins.

use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;

use crate::error::DecodeError;
use crate::event::Event;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Field {
    Mac,
    Serial,
    DeviceName,
    PlateNumber,
    TargetType,
}

impl Field {
    fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"mac" => Some(Field::Mac),
            b"sn" => Some(Field::Serial),
            b"deviceName" => Some(Field::DeviceName),
            b"plateNumber" => Some(Field::PlateNumber),
            b"targetType" => Some(Field::TargetType),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Fields {
    mac: Option<String>,
    serial: Option<String>,
    device_name: Option<String>,
    plate_number: Option<String>,
    target_type: Option<String>,
}

impl Fields {
    fn set(&mut self, field: Field, raw: &str) {
        let value = raw.trim();
        if value.is_empty() {
            return;
        }
        let slot = match field {
            Field::Mac => &mut self.mac,
            Field::Serial => &mut self.serial,
            Field::DeviceName => &mut self.device_name,
            Field::PlateNumber => &mut self.plate_number,
            Field::TargetType => &mut self.target_type,
        };
        if slot.is_none() {
            *slot = Some(value.to_string());
        }
    }

    fn into_event(self) -> Result<Event, DecodeError> {
        let source_serial = self.serial.ok_or(DecodeError::MissingSerial)?;
        Ok(Event {
            source_mac: self.mac,
            source_serial,
            device_name: self.device_name,
            plate_number: self.plate_number,
            target_type: self.target_type,
        })
    }
}

pub fn decode_event(body: &[u8]) -> Result<Event, DecodeError> {
    let text = std::str::from_utf8(body).map_err(|_| DecodeError::Utf8)?;
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    let mut fields = Fields::default();
    let mut current: Option<Field> = None;
    let mut depth = 0usize;
    let mut saw_root = false;

    loop {
        match reader.read_event()? {
            XmlEvent::Start(start) => {
                if depth == 0 && saw_root {
                    return Err(DecodeError::Malformed("multiple root elements"));
                }
                saw_root = true;
                depth += 1;
                current = Field::from_tag(start.local_name().as_ref());
            }
            XmlEvent::Empty(_) => {
                if depth == 0 && saw_root {
                    return Err(DecodeError::Malformed("multiple root elements"));
                }
                saw_root = true;
                current = None;
            }
            XmlEvent::Text(text) => {
                if let Some(field) = current {
                    fields.set(field, &text.unescape()?);
                }
            }
            XmlEvent::CData(data) => {
                if let Some(field) = current {
                    fields.set(field, &String::from_utf8_lossy(&data.into_inner()));
                }
            }
            XmlEvent::End(_) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or(DecodeError::Malformed("unexpected closing tag"))?;
                current = None;
            }
            XmlEvent::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(DecodeError::Malformed("no root element"));
    }
    if depth != 0 {
        return Err(DecodeError::Malformed("unclosed element"));
    }
    fields.into_event()
}
