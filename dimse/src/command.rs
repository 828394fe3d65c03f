//! DIMSE command field enumeration, as specified in DICOM PS3.7.
//!
//! Request commands occupy 0x0001-0x0FFF,
//! response commands occupy 0x8001-0x8FFF;
//! the pattern is `response = request | 0x8000`.

/// The Command Field (0000,0100) of a DICOM command set.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    CCancelRq = 0x0FFF,
    NEventReportRq = 0x0100,
    NEventReportRsp = 0x8100,
    NGetRq = 0x0110,
    NGetRsp = 0x8110,
    NSetRq = 0x0120,
    NSetRsp = 0x8120,
    NActionRq = 0x0130,
    NActionRsp = 0x8130,
    NCreateRq = 0x0140,
    NCreateRsp = 0x8140,
    NDeleteRq = 0x0150,
    NDeleteRsp = 0x8150,
}

impl CommandField {
    /// Interpret a raw Command Field value.
    pub fn from_code(value: u16) -> Option<CommandField> {
        Some(match value {
            0x0001 => CommandField::CStoreRq,
            0x8001 => CommandField::CStoreRsp,
            0x0010 => CommandField::CGetRq,
            0x8010 => CommandField::CGetRsp,
            0x0020 => CommandField::CFindRq,
            0x8020 => CommandField::CFindRsp,
            0x0021 => CommandField::CMoveRq,
            0x8021 => CommandField::CMoveRsp,
            0x0030 => CommandField::CEchoRq,
            0x8030 => CommandField::CEchoRsp,
            0x0FFF => CommandField::CCancelRq,
            0x0100 => CommandField::NEventReportRq,
            0x8100 => CommandField::NEventReportRsp,
            0x0110 => CommandField::NGetRq,
            0x8110 => CommandField::NGetRsp,
            0x0120 => CommandField::NSetRq,
            0x8120 => CommandField::NSetRsp,
            0x0130 => CommandField::NActionRq,
            0x8130 => CommandField::NActionRsp,
            0x0140 => CommandField::NCreateRq,
            0x8140 => CommandField::NCreateRsp,
            0x0150 => CommandField::NDeleteRq,
            0x8150 => CommandField::NDeleteRsp,
            _ => return None,
        })
    }

    /// The raw Command Field value.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether the command is a request (not a response).
    pub fn is_request(self) -> bool {
        self.code() & 0x8000 == 0
    }

    /// Whether the command is a response.
    pub fn is_response(self) -> bool {
        !self.is_request()
    }

    /// The corresponding response command for a request.
    ///
    /// C-CANCEL-RQ has no response and returns `None`.
    pub fn response(self) -> Option<CommandField> {
        if self == CommandField::CCancelRq {
            return None;
        }
        CommandField::from_code(self.code() | 0x8000)
    }

    /// A human readable rendition, e.g. `C-STORE-RQ`.
    pub fn name(self) -> &'static str {
        match self {
            CommandField::CStoreRq => "C-STORE-RQ",
            CommandField::CStoreRsp => "C-STORE-RSP",
            CommandField::CGetRq => "C-GET-RQ",
            CommandField::CGetRsp => "C-GET-RSP",
            CommandField::CFindRq => "C-FIND-RQ",
            CommandField::CFindRsp => "C-FIND-RSP",
            CommandField::CMoveRq => "C-MOVE-RQ",
            CommandField::CMoveRsp => "C-MOVE-RSP",
            CommandField::CEchoRq => "C-ECHO-RQ",
            CommandField::CEchoRsp => "C-ECHO-RSP",
            CommandField::CCancelRq => "C-CANCEL-RQ",
            CommandField::NEventReportRq => "N-EVENT-REPORT-RQ",
            CommandField::NEventReportRsp => "N-EVENT-REPORT-RSP",
            CommandField::NGetRq => "N-GET-RQ",
            CommandField::NGetRsp => "N-GET-RSP",
            CommandField::NSetRq => "N-SET-RQ",
            CommandField::NSetRsp => "N-SET-RSP",
            CommandField::NActionRq => "N-ACTION-RQ",
            CommandField::NActionRsp => "N-ACTION-RSP",
            CommandField::NCreateRq => "N-CREATE-RQ",
            CommandField::NCreateRsp => "N-CREATE-RSP",
            CommandField::NDeleteRq => "N-DELETE-RQ",
            CommandField::NDeleteRsp => "N-DELETE-RSP",
        }
    }
}

impl std::fmt::Display for CommandField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The Priority (0000,0700) of a request.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Priority {
    Low = 0x0002,
    Medium = 0x0000,
    High = 0x0001,
}

impl Priority {
    pub fn from_code(value: u16) -> Option<Priority> {
        match value {
            0x0000 => Some(Priority::Medium),
            0x0001 => Some(Priority::High),
            0x0002 => Some(Priority::Low),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_response_pairing() {
        assert_eq!(
            CommandField::CStoreRq.response(),
            Some(CommandField::CStoreRsp)
        );
        assert_eq!(
            CommandField::NCreateRq.response(),
            Some(CommandField::NCreateRsp)
        );
        assert_eq!(CommandField::CCancelRq.response(), None);

        assert!(CommandField::CFindRq.is_request());
        assert!(CommandField::CFindRsp.is_response());
    }

    #[test]
    fn code_round_trip() {
        for code in [0x0001, 0x8001, 0x0030, 0x8030, 0x0FFF, 0x0140, 0x8120] {
            let field = CommandField::from_code(code).unwrap();
            assert_eq!(field.code(), code);
        }
        assert_eq!(CommandField::from_code(0x4242), None);
    }
}
