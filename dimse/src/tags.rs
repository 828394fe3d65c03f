//! The data element tags this crate reads and writes.
//!
//! A tag is a `(group, element)` pair.
//! Only the command group and the attributes used by the
//! storage, query/retrieve, worklist and MPPS services are listed;
//! everything else passes through opaque.

/// A DICOM data element tag.
pub type Tag = (u16, u16);

// group 0000 — command set

pub const COMMAND_GROUP_LENGTH: Tag = (0x0000, 0x0000);
pub const AFFECTED_SOP_CLASS_UID: Tag = (0x0000, 0x0002);
pub const REQUESTED_SOP_CLASS_UID: Tag = (0x0000, 0x0003);
pub const COMMAND_FIELD: Tag = (0x0000, 0x0100);
pub const MESSAGE_ID: Tag = (0x0000, 0x0110);
pub const MESSAGE_ID_BEING_RESPONDED_TO: Tag = (0x0000, 0x0120);
pub const MOVE_DESTINATION: Tag = (0x0000, 0x0600);
pub const PRIORITY: Tag = (0x0000, 0x0700);
pub const COMMAND_DATA_SET_TYPE: Tag = (0x0000, 0x0800);
pub const STATUS: Tag = (0x0000, 0x0900);
pub const AFFECTED_SOP_INSTANCE_UID: Tag = (0x0000, 0x1000);
pub const REQUESTED_SOP_INSTANCE_UID: Tag = (0x0000, 0x1001);
pub const NUMBER_OF_REMAINING_SUBOPERATIONS: Tag = (0x0000, 0x1020);
pub const NUMBER_OF_COMPLETED_SUBOPERATIONS: Tag = (0x0000, 0x1021);
pub const NUMBER_OF_FAILED_SUBOPERATIONS: Tag = (0x0000, 0x1022);
pub const NUMBER_OF_WARNING_SUBOPERATIONS: Tag = (0x0000, 0x1023);
pub const MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE: Tag = (0x0000, 0x1030);
pub const MOVE_ORIGINATOR_MESSAGE_ID: Tag = (0x0000, 0x1031);

// group 0008

pub const SPECIFIC_CHARACTER_SET: Tag = (0x0008, 0x0005);
pub const SOP_CLASS_UID: Tag = (0x0008, 0x0016);
pub const SOP_INSTANCE_UID: Tag = (0x0008, 0x0018);
pub const STUDY_DATE: Tag = (0x0008, 0x0020);
pub const STUDY_TIME: Tag = (0x0008, 0x0030);
pub const ACCESSION_NUMBER: Tag = (0x0008, 0x0050);
pub const QUERY_RETRIEVE_LEVEL: Tag = (0x0008, 0x0052);
pub const MODALITY: Tag = (0x0008, 0x0060);
pub const MODALITIES_IN_STUDY: Tag = (0x0008, 0x0061);
pub const REFERRING_PHYSICIAN_NAME: Tag = (0x0008, 0x0090);
pub const STATION_NAME: Tag = (0x0008, 0x1010);
pub const STUDY_DESCRIPTION: Tag = (0x0008, 0x1030);
pub const SERIES_DESCRIPTION: Tag = (0x0008, 0x103E);

// group 0010 — patient

pub const PATIENT_NAME: Tag = (0x0010, 0x0010);
pub const PATIENT_ID: Tag = (0x0010, 0x0020);
pub const PATIENT_BIRTH_DATE: Tag = (0x0010, 0x0030);
pub const PATIENT_SEX: Tag = (0x0010, 0x0040);

// group 0018

pub const BODY_PART_EXAMINED: Tag = (0x0018, 0x0015);

// group 0020 — study/series/instance relationship

pub const STUDY_INSTANCE_UID: Tag = (0x0020, 0x000D);
pub const SERIES_INSTANCE_UID: Tag = (0x0020, 0x000E);
pub const STUDY_ID: Tag = (0x0020, 0x0010);
pub const SERIES_NUMBER: Tag = (0x0020, 0x0011);
pub const INSTANCE_NUMBER: Tag = (0x0020, 0x0013);
pub const NUMBER_OF_STUDY_RELATED_SERIES: Tag = (0x0020, 0x1206);
pub const NUMBER_OF_STUDY_RELATED_INSTANCES: Tag = (0x0020, 0x1208);

// group 0040 — worklist and MPPS

pub const SCHEDULED_STATION_AE_TITLE: Tag = (0x0040, 0x0001);
pub const SCHEDULED_PROCEDURE_STEP_START_DATE: Tag = (0x0040, 0x0002);
pub const SCHEDULED_PROCEDURE_STEP_START_TIME: Tag = (0x0040, 0x0003);
pub const SCHEDULED_PROCEDURE_STEP_DESCRIPTION: Tag = (0x0040, 0x0007);
pub const SCHEDULED_PROCEDURE_STEP_ID: Tag = (0x0040, 0x0009);
pub const PERFORMED_STATION_AE_TITLE: Tag = (0x0040, 0x0241);
pub const PERFORMED_PROCEDURE_STEP_START_DATE: Tag = (0x0040, 0x0244);
pub const PERFORMED_PROCEDURE_STEP_START_TIME: Tag = (0x0040, 0x0245);
pub const PERFORMED_PROCEDURE_STEP_END_DATE: Tag = (0x0040, 0x0250);
pub const PERFORMED_PROCEDURE_STEP_END_TIME: Tag = (0x0040, 0x0251);
pub const PERFORMED_PROCEDURE_STEP_STATUS: Tag = (0x0040, 0x0252);
pub const PERFORMED_PROCEDURE_STEP_ID: Tag = (0x0040, 0x0253);
pub const REQUESTED_PROCEDURE_ID: Tag = (0x0040, 0x1001);

// item and sequence delimitation

pub const ITEM: Tag = (0xFFFE, 0xE000);
pub const ITEM_DELIMITATION: Tag = (0xFFFE, 0xE00D);
pub const SEQUENCE_DELIMITATION: Tag = (0xFFFE, 0xE0DD);
