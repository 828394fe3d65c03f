//! The SOP class and transfer syntax UIDs this node serves.

/// Verification SOP class (C-ECHO)
pub const VERIFICATION: &str = "1.2.840.10008.1.1";

/// Implicit VR Little Endian
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

/// Explicit VR Little Endian
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

/// Patient Root Query/Retrieve Information Model - FIND
pub const PATIENT_ROOT_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.1.1";

/// Patient Root Query/Retrieve Information Model - MOVE
pub const PATIENT_ROOT_QR_MOVE: &str = "1.2.840.10008.5.1.4.1.2.1.2";

/// Study Root Query/Retrieve Information Model - FIND
pub const STUDY_ROOT_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";

/// Study Root Query/Retrieve Information Model - MOVE
pub const STUDY_ROOT_QR_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";

/// Modality Worklist Information Model - FIND
pub const MODALITY_WORKLIST_FIND: &str = "1.2.840.10008.5.1.4.31";

/// Modality Performed Procedure Step SOP class (N-CREATE / N-SET)
pub const MODALITY_PERFORMED_PROCEDURE_STEP: &str = "1.2.840.10008.3.1.2.3.3";

/// The composite storage SOP classes this node accepts.
pub const STORAGE_SOP_CLASSES: &[&str] = &[
    // Computed Radiography Image Storage
    "1.2.840.10008.5.1.4.1.1.1",
    // Digital X-Ray Image Storage - For Presentation
    "1.2.840.10008.5.1.4.1.1.1.1",
    // CT Image Storage
    "1.2.840.10008.5.1.4.1.1.2",
    // Enhanced CT Image Storage
    "1.2.840.10008.5.1.4.1.1.2.1",
    // MR Image Storage
    "1.2.840.10008.5.1.4.1.1.4",
    // Enhanced MR Image Storage
    "1.2.840.10008.5.1.4.1.1.4.1",
    // Ultrasound Image Storage
    "1.2.840.10008.5.1.4.1.1.6.1",
    // Secondary Capture Image Storage
    "1.2.840.10008.5.1.4.1.1.7",
    // X-Ray Angiographic Image Storage
    "1.2.840.10008.5.1.4.1.1.12.1",
    // Nuclear Medicine Image Storage
    "1.2.840.10008.5.1.4.1.1.20",
    // Positron Emission Tomography Image Storage
    "1.2.840.10008.5.1.4.1.1.128",
    // RT Image Storage
    "1.2.840.10008.5.1.4.1.1.481.1",
];
