//! End-to-end pairing and calibration lifecycle tests
//!
//! Exercises the full path a real gauge pair takes: registered as spares,
//! paired into a GO/NO-GO set, sent to calibration, certified member by
//! member, and released back to a storage location as a unit. Failure
//! cases assert both the error and that no row moved.

mod helpers;

use std::sync::Arc;

use anyhow::Result;

use gauge_track::{
    CreateSetRequest, GaugeCategory, GaugeError, GaugeSpec, GaugeStatus, NewGauge,
    ReplaceRequest, SharedAttributes, UnpairRequest,
};

use helpers::{
    audited_service, cleanup, register_thread_spare, test_pool, test_service, unique_prefix,
    RecordingAuditSink, ACTOR,
};

fn create_request(prefix: &str, serial_a: &str, serial_b: &str) -> CreateSetRequest {
    CreateSetRequest {
        category: GaugeCategory::ThreadPlug,
        serial_a: format!("{prefix}-{serial_a}"),
        serial_b: format!("{prefix}-{serial_b}"),
        attributes: SharedAttributes {
            storage_location: Some("A1".to_string()),
        },
        actor: ACTOR.to_string(),
    }
}

#[tokio::test]
async fn create_set_assigns_roles_and_shared_attributes() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let service = test_service(&pool);
    let prefix = unique_prefix();

    register_thread_spare(&service, &format!("{prefix}-KZF111")).await?;
    register_thread_spare(&service, &format!("{prefix}-KZF222")).await?;

    let created = service
        .create_set(create_request(&prefix, "KZF111", "KZF222"))
        .await?;

    assert!(created.set_code.starts_with("SP"));
    assert_eq!(created.member_a.serial_number, format!("{prefix}-KZF111"));
    assert_eq!(created.member_a.member_suffix, Some('A'));
    assert_eq!(created.member_b.member_suffix, Some('B'));
    assert_eq!(
        created.member_a.full_identifier(),
        format!("{}A", created.set_code)
    );

    // companion pointers are symmetric, locations shared
    assert_eq!(
        created.member_a.companion_key,
        Some(created.member_b.internal_key)
    );
    assert_eq!(
        created.member_b.companion_key,
        Some(created.member_a.internal_key)
    );
    assert_eq!(created.member_a.storage_location.as_deref(), Some("A1"));
    assert_eq!(created.member_b.storage_location.as_deref(), Some("A1"));

    cleanup(&pool, &prefix).await
}

#[tokio::test]
async fn unpair_returns_both_members_to_spare_addressing() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let service = test_service(&pool);
    let prefix = unique_prefix();

    register_thread_spare(&service, &format!("{prefix}-U100")).await?;
    register_thread_spare(&service, &format!("{prefix}-U200")).await?;
    let created = service.create_set(create_request(&prefix, "U100", "U200")).await?;

    let unpaired = service
        .unpair_set(UnpairRequest {
            set_code: created.set_code.clone(),
            actor: ACTOR.to_string(),
        })
        .await?;
    assert!(unpaired
        .freed_serials
        .contains(&format!("{prefix}-U100")));
    assert!(unpaired
        .freed_serials
        .contains(&format!("{prefix}-U200")));

    for key in [created.member_a.internal_key, created.member_b.internal_key] {
        let gauge = service.get_gauge(key).await?.unwrap();
        assert!(gauge.is_spare());
        assert_eq!(gauge.full_identifier(), gauge.serial_number);
        assert_eq!(gauge.status, GaugeStatus::AvailableForUse);
    }

    // the set code is gone for good
    let err = service
        .unpair_set(UnpairRequest {
            set_code: created.set_code.clone(),
            actor: ACTOR.to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, GaugeError::SetNotFound { .. }));

    cleanup(&pool, &prefix).await
}

#[tokio::test]
async fn pairing_an_already_paired_gauge_fails_and_changes_nothing() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let service = test_service(&pool);
    let prefix = unique_prefix();

    register_thread_spare(&service, &format!("{prefix}-P100")).await?;
    register_thread_spare(&service, &format!("{prefix}-P200")).await?;
    let spare = register_thread_spare(&service, &format!("{prefix}-P300")).await?;
    service.create_set(create_request(&prefix, "P100", "P200")).await?;

    let err = service
        .create_set(create_request(&prefix, "P100", "P300"))
        .await
        .unwrap_err();
    assert!(matches!(err, GaugeError::AlreadyPaired { .. }));

    let untouched = service.get_gauge(spare.internal_key).await?.unwrap();
    assert!(untouched.is_spare());

    cleanup(&pool, &prefix).await
}

#[tokio::test]
async fn incompatible_specs_refuse_to_pair() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let service = test_service(&pool);
    let prefix = unique_prefix();

    let fine = register_thread_spare(&service, &format!("{prefix}-C100")).await?;
    let coarse = service
        .register_spare(
            NewGauge {
                serial_number: format!("{prefix}-C200"),
                spec: GaugeSpec::thread("3/8-16", "2A"),
                storage_location: None,
            },
            ACTOR,
        )
        .await?;

    let err = service
        .create_set(create_request(&prefix, "C100", "C200"))
        .await
        .unwrap_err();
    assert!(matches!(err, GaugeError::IncompatiblePair { .. }));

    for key in [fine.internal_key, coarse.internal_key] {
        assert!(service.get_gauge(key).await?.unwrap().is_spare());
    }

    cleanup(&pool, &prefix).await
}

#[tokio::test]
async fn replacement_seats_incoming_in_outgoing_slot() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let service = test_service(&pool);
    let prefix = unique_prefix();

    register_thread_spare(&service, &format!("{prefix}-R100")).await?;
    register_thread_spare(&service, &format!("{prefix}-R200")).await?;
    register_thread_spare(&service, &format!("{prefix}-R300")).await?;
    let created = service.create_set(create_request(&prefix, "R100", "R200")).await?;

    let replaced = service
        .replace_in_set(ReplaceRequest {
            set_code: created.set_code.clone(),
            outgoing_serial: format!("{prefix}-R200"),
            incoming_serial: format!("{prefix}-R300"),
            actor: ACTOR.to_string(),
        })
        .await?;

    assert_eq!(replaced.set_code, created.set_code);
    assert_eq!(replaced.freed_serial, format!("{prefix}-R200"));
    // incoming takes over the NO-GO slot the outgoing member held
    assert_eq!(replaced.incoming.member_suffix, Some('B'));
    assert_eq!(
        replaced.incoming.companion_key,
        Some(created.member_a.internal_key)
    );
    assert_eq!(
        replaced.remaining.companion_key,
        Some(replaced.incoming.internal_key)
    );

    let freed = service.get_gauge(created.member_b.internal_key).await?.unwrap();
    assert!(freed.is_spare());

    let members = service.get_set_members(&created.set_code).await?;
    assert_eq!(members.len(), 2);

    cleanup(&pool, &prefix).await
}

#[tokio::test]
async fn replacement_requires_a_spare_incoming_gauge() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let service = test_service(&pool);
    let prefix = unique_prefix();

    register_thread_spare(&service, &format!("{prefix}-S100")).await?;
    register_thread_spare(&service, &format!("{prefix}-S200")).await?;
    register_thread_spare(&service, &format!("{prefix}-S300")).await?;
    register_thread_spare(&service, &format!("{prefix}-S400")).await?;
    let first = service.create_set(create_request(&prefix, "S100", "S200")).await?;
    service.create_set(create_request(&prefix, "S300", "S400")).await?;

    // S300 belongs to the second set, not spare
    let err = service
        .replace_in_set(ReplaceRequest {
            set_code: first.set_code,
            outgoing_serial: format!("{prefix}-S200"),
            incoming_serial: format!("{prefix}-S300"),
            actor: ACTOR.to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, GaugeError::NotASpare { .. }));

    cleanup(&pool, &prefix).await
}

#[tokio::test]
async fn full_calibration_cycle_releases_set_to_destination() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let service = test_service(&pool);
    let prefix = unique_prefix();

    register_thread_spare(&service, &format!("{prefix}-F100")).await?;
    register_thread_spare(&service, &format!("{prefix}-F200")).await?;
    let created = service.create_set(create_request(&prefix, "F100", "F200")).await?;
    let id_a = format!("{}A", created.set_code);
    let id_b = format!("{}B", created.set_code);

    // members go to the vendor individually, addressed by set member code
    let sent = service
        .send_to_calibration(&[id_a.clone(), id_b.clone()], ACTOR)
        .await?;
    assert_eq!(sent.updated.len(), 2);
    for change in &sent.updated {
        assert_eq!(change.to, GaugeStatus::OutForCalibration);
    }

    service.mark_returned(&id_a, ACTOR).await?;
    service.mark_returned(&id_b, ACTOR).await?;

    // the first certificate alone advances nobody
    let first_cert = service
        .upload_certificate(&id_a, "certs/f100.pdf", ACTOR)
        .await?;
    assert_eq!(first_cert.status, GaugeStatus::PendingCertificate);
    assert!(!first_cert.set_ready_for_release);

    // the second moves both members to PendingRelease together
    let second_cert = service
        .upload_certificate(&id_b, "certs/f200.pdf", ACTOR)
        .await?;
    assert_eq!(second_cert.status, GaugeStatus::PendingRelease);
    assert!(second_cert.set_ready_for_release);
    for member in service.get_set_members(&created.set_code).await? {
        assert_eq!(member.status, GaugeStatus::PendingRelease);
    }

    let released = service.release_set(&created.set_code, "B2", ACTOR).await?;
    assert_eq!(released.storage_location, "B2");
    assert_eq!(released.members.len(), 2);
    for member in &released.members {
        assert_eq!(member.status, GaugeStatus::AvailableForUse);
        assert_eq!(member.storage_location.as_deref(), Some("B2"));
    }

    cleanup(&pool, &prefix).await
}

#[tokio::test]
async fn release_is_blocked_until_both_members_are_certified() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let service = test_service(&pool);
    let prefix = unique_prefix();

    register_thread_spare(&service, &format!("{prefix}-H100")).await?;
    register_thread_spare(&service, &format!("{prefix}-H200")).await?;
    let created = service.create_set(create_request(&prefix, "H100", "H200")).await?;
    let id_a = format!("{}A", created.set_code);
    let id_b = format!("{}B", created.set_code);

    service
        .send_to_calibration(&[id_a.clone(), id_b.clone()], ACTOR)
        .await?;
    service.mark_returned(&id_a, ACTOR).await?;
    service.mark_returned(&id_b, ACTOR).await?;
    let partial = service
        .upload_certificate(&id_a, "certs/h100.pdf", ACTOR)
        .await?;
    assert_eq!(partial.status, GaugeStatus::PendingCertificate);

    let err = service
        .release_set(&created.set_code, "B2", ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(err, GaugeError::InvalidStateTransition { .. }));

    // one certificate moves nobody; both members still await release eligibility
    let members = service.get_set_members(&created.set_code).await?;
    for member in &members {
        assert_eq!(member.status, GaugeStatus::PendingCertificate);
    }

    cleanup(&pool, &prefix).await
}

#[tokio::test]
async fn spare_gauge_runs_the_cycle_alone() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let service = test_service(&pool);
    let prefix = unique_prefix();

    let serial = format!("{prefix}-L100");
    let spare = register_thread_spare(&service, &serial).await?;

    service.send_to_calibration(&[serial.clone()], ACTOR).await?;
    service.mark_returned(&serial, ACTOR).await?;

    let cert = service
        .upload_certificate(&serial, "certs/l100.pdf", ACTOR)
        .await?;
    // no companion, so a single certificate makes it releasable
    assert!(cert.set_ready_for_release);

    let change = service.release_gauge(&serial, "C7", ACTOR).await?;
    assert_eq!(change.to, GaugeStatus::AvailableForUse);

    let after = service.get_gauge(spare.internal_key).await?.unwrap();
    assert_eq!(after.storage_location.as_deref(), Some("C7"));

    cleanup(&pool, &prefix).await
}

#[tokio::test]
async fn send_rejects_gauges_outside_sendable_states() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let service = test_service(&pool);
    let prefix = unique_prefix();

    let serial = format!("{prefix}-X100");
    register_thread_spare(&service, &serial).await?;
    service.send_to_calibration(&[serial.clone()], ACTOR).await?;

    let err = service
        .send_to_calibration(&[serial.clone()], ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GaugeError::InvalidStateTransition {
            from: GaugeStatus::OutForCalibration,
            ..
        }
    ));

    cleanup(&pool, &prefix).await
}

#[tokio::test]
async fn plain_gauges_resolve_by_set_member_code_only() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let service = test_service(&pool);
    let prefix = unique_prefix();

    let serial = format!("{prefix}-PL100");
    service
        .register_spare(
            NewGauge {
                serial_number: serial.clone(),
                spec: GaugeSpec {
                    category: GaugeCategory::PlainPlug,
                    thread_size: None,
                    thread_class: None,
                },
                storage_location: None,
            },
            ACTOR,
        )
        .await?;

    // plain plugs carry no dual identifiers, so a bare serial does not resolve
    let err = service
        .send_to_calibration(&[serial], ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(err, GaugeError::NotFound { .. }));

    cleanup(&pool, &prefix).await
}

#[tokio::test]
async fn paired_thread_gauges_keep_serial_addressing() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let service = test_service(&pool);
    let prefix = unique_prefix();

    let serial_a = format!("{prefix}-TH100");
    register_thread_spare(&service, &serial_a).await?;
    register_thread_spare(&service, &format!("{prefix}-TH200")).await?;
    service.create_set(create_request(&prefix, "TH100", "TH200")).await?;

    // dual-identifier categories stay serial-resolvable after pairing
    let sent = service.send_to_calibration(&[serial_a], ACTOR).await?;
    assert_eq!(sent.updated.len(), 1);
    assert_eq!(sent.updated[0].to, GaugeStatus::OutForCalibration);

    cleanup(&pool, &prefix).await
}

#[tokio::test]
async fn unpair_audit_event_names_both_gauges() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let sink = Arc::new(RecordingAuditSink::default());
    let service = audited_service(&pool, Arc::clone(&sink));
    let prefix = unique_prefix();

    register_thread_spare(&service, &format!("{prefix}-AU100")).await?;
    register_thread_spare(&service, &format!("{prefix}-AU200")).await?;
    let created = service.create_set(create_request(&prefix, "AU100", "AU200")).await?;
    service
        .unpair_set(UnpairRequest {
            set_code: created.set_code.clone(),
            actor: ACTOR.to_string(),
        })
        .await?;

    let events = sink.events();
    let unpair = events
        .iter()
        .find(|e| e.action == "gauge.set.unpair")
        .expect("unpair event recorded");
    assert_eq!(unpair.set_code.as_deref(), Some(created.set_code.as_str()));
    assert_eq!(unpair.gauge_keys.len(), 2);
    assert!(unpair.gauge_keys.contains(&created.member_a.internal_key));
    assert!(unpair.gauge_keys.contains(&created.member_b.internal_key));

    cleanup(&pool, &prefix).await
}

#[tokio::test]
async fn unknown_identifiers_resolve_to_not_found() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let service = test_service(&pool);
    let prefix = unique_prefix();

    let err = service
        .send_to_calibration(&[format!("{prefix}-NOPE")], ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(err, GaugeError::NotFound { .. }));

    Ok(())
}
