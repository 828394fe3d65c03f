//! Move service class provider (C-MOVE).
//!
//! Matching instances are enumerated from the index;
//! for each one a C-STORE sub-operation is performed
//! over an outbound association to the requested destination.
//! Interim pending responses carry the
//! remaining/completed/failed/warning counters,
//! and cancellation is observed before each sub-operation.

use std::collections::HashMap;
use std::sync::Arc;

use pacs_dimse::command::CommandField;
use pacs_dimse::dataset::DataSet;
use pacs_dimse::message::DimseMessage;
use pacs_dimse::{status, tags, CommandSet};
use pacs_index::{IndexDatabase, InstanceRecord};
use pacs_pipeline::CancelRegistry;
use pacs_ul::association::client::{ClientAssociation, ClientAssociationOptions};
use pacs_ul::pdu::{PDataValueType, Pdu};
use pacs_ul::FullAeAddr;
use snafu::ResultExt;
use tracing::{debug, info, warn};

use crate::blob::BlobStore;
use crate::{
    uids, DimseService, MissingAttributeSnafu, RequestContext, Responder, Result,
    SubOperationSnafu,
};

/// A C-MOVE destination this node is allowed to send to.
pub type RemoteNode = FullAeAddr;

/// Moves stored instances to other application entities.
pub struct MoveScp {
    index: Arc<IndexDatabase>,
    blobs: Arc<dyn BlobStore>,
    cancels: Arc<CancelRegistry>,
    /// this node's AE title, reported as the move originator
    ae_title: String,
    /// known destinations, keyed by AE title
    destinations: HashMap<String, RemoteNode>,
}

impl MoveScp {
    pub fn new(
        index: Arc<IndexDatabase>,
        blobs: Arc<dyn BlobStore>,
        cancels: Arc<CancelRegistry>,
        ae_title: impl Into<String>,
        destinations: impl IntoIterator<Item = RemoteNode>,
    ) -> MoveScp {
        MoveScp {
            index,
            blobs,
            cancels,
            ae_title: ae_title.into(),
            destinations: destinations
                .into_iter()
                .map(|node| (node.ae_title().to_string(), node))
                .collect(),
        }
    }

    /// Enumerate the instances selected by the identifier.
    fn collect_instances(&self, identifier: &DataSet) -> Result<Vec<InstanceRecord>> {
        let level = identifier
            .get_str(tags::QUERY_RETRIEVE_LEVEL)
            .unwrap_or_else(|| "STUDY".to_string());

        let mut instances = Vec::new();
        match level.as_str() {
            "PATIENT" => {
                let patient_id = identifier.get_str(tags::PATIENT_ID).ok_or_else(|| {
                    MissingAttributeSnafu { what: "Patient ID" }.build()
                })?;
                for study in self.index.list_studies(&patient_id)? {
                    for series in self.index.list_series(&study.study_uid)? {
                        instances.extend(self.index.list_instances(&series.series_uid)?);
                    }
                }
            }
            "STUDY" => {
                let study_uid =
                    identifier.get_str(tags::STUDY_INSTANCE_UID).ok_or_else(|| {
                        MissingAttributeSnafu {
                            what: "Study Instance UID",
                        }
                        .build()
                    })?;
                for series in self.index.list_series(&study_uid)? {
                    instances.extend(self.index.list_instances(&series.series_uid)?);
                }
            }
            "SERIES" => {
                let series_uid =
                    identifier.get_str(tags::SERIES_INSTANCE_UID).ok_or_else(|| {
                        MissingAttributeSnafu {
                            what: "Series Instance UID",
                        }
                        .build()
                    })?;
                instances.extend(self.index.list_instances(&series_uid)?);
            }
            _ => {
                let sop_uid = identifier.get_str(tags::SOP_INSTANCE_UID).ok_or_else(|| {
                    MissingAttributeSnafu {
                        what: "SOP Instance UID",
                    }
                    .build()
                })?;
                instances.extend(self.index.find_instance(&sop_uid)?);
            }
        }
        Ok(instances)
    }

    /// Open the outbound association for the sub-operations,
    /// proposing a context per distinct SOP class
    /// with the stored transfer syntaxes.
    fn connect_destination(
        &self,
        destination: &RemoteNode,
        instances: &[InstanceRecord],
    ) -> Result<ClientAssociation> {
        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(self.ae_title.clone())
            .called_ae_title(destination.ae_title().to_string());

        let mut sop_classes: Vec<&str> = instances
            .iter()
            .map(|i| i.sop_class_uid.as_str())
            .collect();
        sop_classes.sort_unstable();
        sop_classes.dedup();
        for sop_class in sop_classes {
            options = options.with_abstract_syntax(sop_class.to_string());
        }

        let mut transfer_syntaxes: Vec<&str> = instances
            .iter()
            .map(|i| i.transfer_syntax.as_str())
            .filter(|ts| !ts.is_empty())
            .collect();
        transfer_syntaxes.sort_unstable();
        transfer_syntaxes.dedup();
        for transfer_syntax in transfer_syntaxes {
            options = options.with_transfer_syntax(transfer_syntax.to_string());
        }

        options
            .establish(destination.socket_addr())
            .context(SubOperationSnafu)
    }

    /// Perform one C-STORE sub-operation; true means the peer
    /// acknowledged with a success status.
    fn store_one(
        &self,
        association: &mut ClientAssociation,
        instance: &InstanceRecord,
        sub_message_id: u16,
        originator_message_id: u16,
    ) -> Result<bool> {
        let context = match association.accepted_context_for(&instance.sop_class_uid) {
            Some(context) => context.clone(),
            None => {
                warn!(
                    "destination accepted no context for `{}`",
                    instance.sop_class_uid
                );
                return Ok(false);
            }
        };
        if context.transfer_syntax != instance.transfer_syntax {
            // no transcoding here: the stored encoding must be accepted as-is
            warn!(
                "destination wants `{}` but instance `{}` is stored as `{}`",
                context.transfer_syntax, instance.sop_uid, instance.transfer_syntax
            );
            return Ok(false);
        }

        let payload = self.blobs.get(&instance.file_path)?;

        let command = CommandSet::store_rq_for_move(
            sub_message_id,
            &instance.sop_class_uid,
            &instance.sop_uid,
            &self.ae_title,
            originator_message_id,
        );
        association
            .send_command(context.id, command.encode())
            .context(SubOperationSnafu)?;
        for pdu in pacs_ul::association::pdata::fragment_pdata(
            context.id,
            PDataValueType::Data,
            payload,
            association.peer_max_pdu_length(),
        ) {
            association.send(&pdu).context(SubOperationSnafu)?;
        }

        // collect the C-STORE response command
        let mut command_bytes = Vec::new();
        loop {
            match association.receive().context(SubOperationSnafu)? {
                Pdu::PData { data } => {
                    let mut complete = false;
                    for value in data {
                        if value.value_type == PDataValueType::Command {
                            command_bytes.extend(value.data);
                            complete = value.is_last;
                        }
                    }
                    if complete {
                        break;
                    }
                }
                Pdu::AbortRQ { .. } => {
                    return Err(pacs_ul::association::AbortedSnafu.build())
                        .context(SubOperationSnafu);
                }
                pdu => {
                    warn!("unexpected {} during sub-operation", pdu.short_description());
                    return Ok(false);
                }
            }
        }

        let response = CommandSet::decode(&command_bytes)?;
        let sub_status = response.status.unwrap_or(status::ERROR_UNABLE_TO_PROCESS);
        debug!(
            "sub-operation for `{}` finished with {:#06X}",
            instance.sop_uid, sub_status
        );
        Ok(status::is_success(sub_status) || status::is_warning(sub_status))
    }
}

impl DimseService for MoveScp {
    fn supported_sop_classes(&self) -> &[&'static str] {
        &[uids::PATIENT_ROOT_QR_MOVE, uids::STUDY_ROOT_QR_MOVE]
    }

    fn handle(
        &self,
        ctx: &RequestContext,
        message: DimseMessage,
        responder: &mut dyn Responder,
    ) -> Result<()> {
        let command = message.command;
        match command.command_field {
            CommandField::CMoveRq => {}
            CommandField::CCancelRq => return Ok(()),
            other => {
                warn!("move service ignoring {}", other);
                return Ok(());
            }
        }

        let mut respond = |command: CommandSet| {
            responder.respond(DimseMessage {
                context_id: ctx.context_id,
                command,
                dataset: None,
            })
        };

        // resolve the destination before looking at the identifier
        let destination_ae = command.move_destination.clone().unwrap_or_default();
        let Some(destination) = self.destinations.get(&destination_ae) else {
            warn!(
                "C-MOVE to unknown destination `{}` from `{}`",
                destination_ae, ctx.calling_ae_title
            );
            return respond(CommandSet::move_rsp(
                &command,
                status::REFUSED_MOVE_DESTINATION_UNKNOWN,
                0,
                0,
                0,
                0,
            ));
        };

        let payload = message.dataset.ok_or_else(|| {
            MissingAttributeSnafu {
                what: "move identifier",
            }
            .build()
        })?;
        let identifier = DataSet::read(&payload, &ctx.transfer_syntax)?;
        let instances = self.collect_instances(&identifier)?;

        if instances.is_empty() {
            return respond(CommandSet::move_rsp(&command, status::SUCCESS, 0, 0, 0, 0));
        }

        info!(
            "C-MOVE of {} instance(s) to `{}` ({})",
            instances.len(),
            destination_ae,
            destination
        );

        let mut association = match self.connect_destination(destination, &instances) {
            Ok(association) => association,
            Err(error) => {
                warn!("could not reach destination `{}`: {}", destination_ae, error);
                return respond(CommandSet::move_rsp(
                    &command,
                    status::REFUSED_OUT_OF_RESOURCES_SUBOPS,
                    instances.len() as u16,
                    0,
                    0,
                    0,
                ));
            }
        };

        let message_id = command.message_id.unwrap_or_default();
        let mut remaining = instances.len() as u16;
        let mut completed: u16 = 0;
        let mut failed: u16 = 0;
        let warning: u16 = 0;

        for (sub_index, instance) in instances.iter().enumerate() {
            // the cancellation checkpoint sits before every sub-operation
            if self.cancels.is_cancelled(ctx.session_id, message_id) {
                self.cancels.clear(ctx.session_id, message_id);
                debug!("C-MOVE {} cancelled by the peer", message_id);
                let _ = association.release();
                return respond(CommandSet::move_rsp(
                    &command,
                    status::CANCEL,
                    remaining,
                    completed,
                    failed,
                    warning,
                ));
            }

            let ok = self
                .store_one(
                    &mut association,
                    instance,
                    sub_index as u16 + 1,
                    message_id,
                )
                .unwrap_or_else(|error| {
                    warn!("sub-operation failed: {}", error);
                    false
                });
            remaining -= 1;
            if ok {
                completed += 1;
            } else {
                failed += 1;
            }

            if remaining > 0 {
                respond(CommandSet::move_rsp(
                    &command,
                    status::PENDING,
                    remaining,
                    completed,
                    failed,
                    warning,
                ))?;
            }
        }

        if let Err(error) = association.release() {
            debug!("release of the sub-operation association failed: {}", error);
        }

        let final_status = if failed > 0 {
            status::WARNING_SUBOPS_COMPLETE_FAILURES
        } else {
            status::SUCCESS
        };
        respond(CommandSet::move_rsp(
            &command,
            final_status,
            0,
            completed,
            failed,
            warning,
        ))
    }
}
