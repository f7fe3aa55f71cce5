// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Bit-exact export file codec (§4.3): a ZIP with exactly two entries,
//! `export.bin` (16-byte header + protobuf `TemporaryExposureKeyExport`)
//! and `export.sig` (protobuf `TEKSignatureList`).

use std::io::{Cursor, Read, Write};

use chrono::{DateTime, Utc};
use export_config::{Exposure, ReportType, SignatureInfo};
use prost::Message;
use sha2::{Digest, Sha256};
use zip::{write::FileOptions, ZipArchive, ZipWriter};

use crate::error::CodecError;
use crate::keymanager::{KeyManager, SignatureRequest};
use crate::proto;

/// 16 bytes, ASCII, trailing spaces. Written and checked verbatim; never
/// reinterpreted as anything but a fixed byte string.
pub const HEADER: &[u8; 16] = b"EK Export v1    ";

const SIGNATURE_ALGORITHM_ECDSA_P256_SHA256: &str = "1.2.840.10045.4.3.2";
const DEFAULT_ROLLING_PERIOD: i32 = 144;

/// Everything needed to build one `TemporaryExposureKeyExport`, independent
/// of storage: the worker assembles this from an `ExportBatch` plus the
/// exposures it read for one physical file.
pub struct ExportFileContents<'a> {
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub region: String,
    pub batch_num: i32,
    pub batch_size: i32,
    pub signature_infos: &'a [SignatureInfo],
    pub keys: Vec<Exposure>,
    pub revised_keys: Vec<Exposure>,
}

fn report_type_to_proto(rt: ReportType, revised_slot: bool) -> proto::ReportType {
    match (rt, revised_slot) {
        (ReportType::Clinical, _) => proto::ReportType::ConfirmedClinicalDiagnosis,
        (ReportType::Confirmed, _) => proto::ReportType::ConfirmedTest,
        (ReportType::SelfReport, _) => proto::ReportType::SelfReport,
        (ReportType::Negative, true) => proto::ReportType::Revoked,
        (ReportType::Negative, false) => proto::ReportType::Unknown,
        (ReportType::Unknown, _) => proto::ReportType::Unknown,
    }
}

fn exposure_to_proto_key(e: &Exposure, revised_slot: bool) -> Result<proto::TemporaryExposureKey, CodecError> {
    if e.exposure_key.len() != 16 {
        return Err(CodecError::InvalidKeyLength(e.exposure_key.len()));
    }
    let report_type = if revised_slot {
        e.revised_report_type.unwrap_or(e.report_type)
    } else {
        e.report_type
    };
    Ok(proto::TemporaryExposureKey {
        key_data: e.exposure_key.to_vec(),
        transmission_risk_level: e.transmission_risk,
        // Omitted (left at the zero value) when the source interval number is 0.
        rolling_start_interval_number: if e.interval_number == 0 { 0 } else { e.interval_number },
        // Omitted (left at the zero value, which prost/proto3 drops on the
        // wire) iff it's the implicit default of 144.
        rolling_period: if e.interval_count == DEFAULT_ROLLING_PERIOD {
            0
        } else {
            e.interval_count
        },
        report_type: report_type_to_proto(report_type, revised_slot) as i32,
        days_since_onset_of_symptoms: e.days_since_symptom_onset.unwrap_or(0),
    })
}

/// Builds the protobuf message, sorting `keys`/`revised_keys` by `key_data`
/// lexicographically (so the same input set always yields identical bytes,
/// independent of read order).
fn build_export_proto(contents: &ExportFileContents<'_>) -> Result<proto::TemporaryExposureKeyExport, CodecError> {
    let mut keys: Vec<proto::TemporaryExposureKey> = contents
        .keys
        .iter()
        .map(|e| exposure_to_proto_key(e, false))
        .collect::<Result<_, _>>()?;
    keys.sort_by(|a, b| a.key_data.cmp(&b.key_data));

    let mut revised_keys: Vec<proto::TemporaryExposureKey> = contents
        .revised_keys
        .iter()
        .map(|e| exposure_to_proto_key(e, true))
        .collect::<Result<_, _>>()?;
    revised_keys.sort_by(|a, b| a.key_data.cmp(&b.key_data));

    let signature_infos = contents
        .signature_infos
        .iter()
        .map(|info| proto::SignatureInfo {
            verification_key_version: info.signing_key_version.clone(),
            verification_key_id: info.signing_key_id.clone(),
            signature_algorithm: SIGNATURE_ALGORITHM_ECDSA_P256_SHA256.to_string(),
        })
        .collect();

    Ok(proto::TemporaryExposureKeyExport {
        start_timestamp: contents.start_timestamp.timestamp() as u64,
        end_timestamp: contents.end_timestamp.timestamp() as u64,
        region: contents.region.clone(),
        batch_num: contents.batch_num,
        batch_size: contents.batch_size,
        signature_infos,
        keys,
        revised_keys,
    })
}

fn zip_write_options() -> FileOptions {
    FileOptions::default().compression_method(zip::CompressionMethod::Deflated)
}

/// Marshals `contents` into a complete ZIP archive, signing `export.bin`
/// with every configured signer via `key_manager`.
pub async fn marshal(
    contents: &ExportFileContents<'_>,
    key_manager: &dyn KeyManager,
) -> Result<Vec<u8>, CodecError> {
    let export = build_export_proto(contents)?;

    let mut bin = Vec::with_capacity(HEADER.len() + export.encoded_len());
    bin.extend_from_slice(HEADER);
    export.encode(&mut bin).map_err(|e| CodecError::Zip(e.to_string()))?;

    let digest: [u8; 32] = Sha256::digest(&bin).into();

    let mut signatures = Vec::with_capacity(contents.signature_infos.len());
    for info in contents.signature_infos {
        let signature = key_manager
            .sign(&SignatureRequest { signature_info: info }, &digest)
            .await?;
        signatures.push(proto::TekSignature {
            signature_info: Some(proto::SignatureInfo {
                verification_key_version: info.signing_key_version.clone(),
                verification_key_id: info.signing_key_id.clone(),
                signature_algorithm: SIGNATURE_ALGORITHM_ECDSA_P256_SHA256.to_string(),
            }),
            batch_num: contents.batch_num,
            batch_size: contents.batch_size,
            signature,
        });
    }
    let sig_list = proto::TekSignatureList { signatures };
    let mut sig_bytes = Vec::with_capacity(sig_list.encoded_len());
    sig_list.encode(&mut sig_bytes).map_err(|e| CodecError::Zip(e.to_string()))?;

    let mut zip_bytes = Cursor::new(Vec::new());
    {
        let mut writer = ZipWriter::new(&mut zip_bytes);
        writer
            .start_file("export.bin", zip_write_options())
            .map_err(|e| CodecError::Zip(e.to_string()))?;
        writer.write_all(&bin).map_err(|e| CodecError::Zip(e.to_string()))?;
        writer
            .start_file("export.sig", zip_write_options())
            .map_err(|e| CodecError::Zip(e.to_string()))?;
        writer.write_all(&sig_bytes).map_err(|e| CodecError::Zip(e.to_string()))?;
        writer.finish().map_err(|e| CodecError::Zip(e.to_string()))?;
    }
    Ok(zip_bytes.into_inner())
}

/// Result of [`unmarshal`]: the decoded message plus the raw digest callers
/// can independently verify signatures against.
pub struct UnmarshalledExport {
    pub export: proto::TemporaryExposureKeyExport,
    pub signatures: proto::TekSignatureList,
    pub bin_sha256: [u8; 32],
}

pub fn unmarshal(zip_bytes: &[u8]) -> Result<UnmarshalledExport, CodecError> {
    let mut archive = ZipArchive::new(Cursor::new(zip_bytes)).map_err(|e| CodecError::Zip(e.to_string()))?;

    let mut bin = Vec::new();
    {
        let mut entry = archive.by_name("export.bin").map_err(|_| CodecError::MissingBin)?;
        entry.read_to_end(&mut bin).map_err(|e| CodecError::Zip(e.to_string()))?;
    }
    if bin.len() < HEADER.len() || &bin[..HEADER.len()] != HEADER {
        return Err(CodecError::BadHeader {
            expected: HEADER.to_vec(),
            got: bin.get(..HEADER.len()).unwrap_or(&bin).to_vec(),
        });
    }
    let bin_sha256: [u8; 32] = Sha256::digest(&bin).into();
    let export = proto::TemporaryExposureKeyExport::decode(&bin[HEADER.len()..])?;

    let mut sig_bytes = Vec::new();
    {
        let mut entry = archive.by_name("export.sig").map_err(|_| CodecError::MissingSig)?;
        entry.read_to_end(&mut sig_bytes).map_err(|e| CodecError::Zip(e.to_string()))?;
    }
    let signatures = proto::TekSignatureList::decode(sig_bytes.as_slice())?;

    Ok(UnmarshalledExport {
        export,
        signatures,
        bin_sha256,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeyManagerError;
    use async_trait::async_trait;

    struct FixedSigner;

    #[async_trait]
    impl KeyManager for FixedSigner {
        async fn sign(&self, _request: &SignatureRequest<'_>, digest: &[u8; 32]) -> Result<Vec<u8>, KeyManagerError> {
            Ok(digest.to_vec())
        }
    }

    fn exposure(key_byte: u8, interval_number: i32, rolling_period: i32) -> Exposure {
        Exposure {
            exposure_key: [key_byte; 16],
            interval_number,
            interval_count: rolling_period,
            regions: vec!["US".into()],
            created_at: Utc::now(),
            traveler: false,
            local_provenance: true,
            transmission_risk: 1,
            report_type: ReportType::Confirmed,
            days_since_symptom_onset: None,
            revised_report_type: None,
            revised_at: None,
        }
    }

    fn sig_infos() -> Vec<SignatureInfo> {
        vec![SignatureInfo {
            signature_info_id: 1,
            signing_key_version: "v1".into(),
            signing_key_id: "key-1".into(),
            kms_resource_id: "resource-a".into(),
            end_timestamp: None,
        }]
    }

    #[tokio::test]
    async fn roundtrips_header_and_message() {
        let infos = sig_infos();
        let contents = ExportFileContents {
            start_timestamp: Utc::now(),
            end_timestamp: Utc::now(),
            region: "US".into(),
            batch_num: 1,
            batch_size: 1,
            signature_infos: &infos,
            keys: vec![exposure(2, 2650001, 144), exposure(1, 2650002, 100)],
            revised_keys: vec![],
        };
        let zip_bytes = marshal(&contents, &FixedSigner).await.unwrap();
        let unmarshalled = unmarshal(&zip_bytes).unwrap();

        assert_eq!(unmarshalled.export.region, "US");
        assert_eq!(unmarshalled.export.keys.len(), 2);
        // Sorted lexicographically by key_data: [1;16] < [2;16].
        assert_eq!(unmarshalled.export.keys[0].key_data, vec![1u8; 16]);
        assert_eq!(unmarshalled.export.keys[1].key_data, vec![2u8; 16]);
        // rolling_period == 144 is the implicit default and is omitted (0 on the wire).
        assert_eq!(unmarshalled.export.keys[1].rolling_period, 0);
        assert_eq!(unmarshalled.export.keys[0].rolling_period, 100);
        assert_eq!(unmarshalled.signatures.signatures.len(), 1);
    }

    #[test]
    fn rejects_missing_header() {
        let mut zip_bytes = Cursor::new(Vec::new());
        {
            let mut writer = ZipWriter::new(&mut zip_bytes);
            writer.start_file("export.bin", zip_write_options()).unwrap();
            writer.write_all(b"not the header at all!!!").unwrap();
            writer.start_file("export.sig", zip_write_options()).unwrap();
            writer.write_all(b"").unwrap();
            writer.finish().unwrap();
        }
        let result = unmarshal(&zip_bytes.into_inner());
        assert!(matches!(result, Err(CodecError::BadHeader { .. })));
    }

    #[test]
    fn rejects_missing_bin_entry() {
        let mut zip_bytes = Cursor::new(Vec::new());
        {
            let mut writer = ZipWriter::new(&mut zip_bytes);
            writer.start_file("export.sig", zip_write_options()).unwrap();
            writer.write_all(b"").unwrap();
            writer.finish().unwrap();
        }
        let result = unmarshal(&zip_bytes.into_inner());
        assert!(matches!(result, Err(CodecError::MissingBin)));
    }

    #[tokio::test]
    async fn output_is_order_independent() {
        let infos = sig_infos();
        let make = |keys: Vec<Exposure>| ExportFileContents {
            start_timestamp: Utc::now(),
            end_timestamp: Utc::now(),
            region: "US".into(),
            batch_num: 1,
            batch_size: 1,
            signature_infos: &infos,
            keys,
            revised_keys: vec![],
        };
        let a = build_export_proto(&make(vec![exposure(1, 1, 144), exposure(2, 2, 144)])).unwrap();
        let b = build_export_proto(&make(vec![exposure(2, 2, 144), exposure(1, 1, 144)])).unwrap();
        assert_eq!(a.encode_to_vec(), b.encode_to_vec());
    }
}
