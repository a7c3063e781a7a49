use std::sync::Arc;

use bytes::Bytes;
use pretty_assertions::assert_eq;

use super::*;
use crate::channel::Action;
use crate::protocol::{SubAck, Subscribe, Subscription, Will};

const UPSTREAM: ChannelId = ChannelId(100);
const A: ChannelId = ChannelId(1);
const B: ChannelId = ChannelId(2);
const C: ChannelId = ChannelId(3);

#[derive(Debug, PartialEq)]
enum Op {
    Send(ChannelId, Message),
    Close(ChannelId),
    Pause(ChannelId),
    Resume(ChannelId),
}

fn ops(ctx: &mut Outbox) -> Vec<Op> {
    ctx.take()
        .into_iter()
        .map(|action| match action {
            Action::Send { channel, message } => Op::Send(channel, message),
            Action::Close(channel) => Op::Close(channel),
            Action::PauseRead(channel) => Op::Pause(channel),
            Action::ResumeRead(channel) => Op::Resume(channel),
            Action::Connect { .. } => panic!("unexpected connect"),
        })
        .collect()
}

fn founding() -> Connect {
    Connect {
        client_id: "shared".into(),
        clean_session: false,
        keep_alive: 30,
        username: Some("U".into()),
        password: Some(Bytes::from_static(b"P")),
        ..Default::default()
    }
}

fn accepted() -> ConnAck {
    ConnAck::new(ConnectReturnCode::Accepted)
}

fn connack(code: ConnectReturnCode) -> Message {
    Message::ConnAck(ConnAck::new(code))
}

/// Session with an accepted upstream and the given members attached
fn connected(max_in_flight: usize, members: &[ChannelId]) -> (Session, Outbox) {
    let mut session = Session::new(founding(), UPSTREAM, max_in_flight);
    let mut ctx = Outbox::default();
    session.upstream_connack(&mut ctx, accepted());
    for &member in members {
        assert!(session.attach(&mut ctx, member, &founding()));
    }
    ctx.take();
    (session, ctx)
}

fn publish(id: u16, topic: &str) -> Publish {
    Publish {
        qos: QoS::AtLeastOnce,
        topic: Arc::from(topic),
        message_id: id,
        payload: Bytes::from_static(b"x"),
        ..Default::default()
    }
}

fn delivered(ops: &[Op]) -> Vec<(ChannelId, u16, String)> {
    ops.iter()
        .filter_map(|op| match op {
            Op::Send(channel, Message::Publish(p)) => {
                Some((*channel, p.message_id, p.topic.to_string()))
            }
            _ => None,
        })
        .collect()
}

#[test]
fn test_upstream_opened_replays_founding_connect() {
    let mut session = Session::new(founding(), UPSTREAM, 10);
    let mut ctx = Outbox::default();
    session.upstream_opened(&mut ctx);
    assert_eq!(
        ops(&mut ctx),
        vec![Op::Send(UPSTREAM, Message::Connect(Box::new(founding())))]
    );
}

#[test]
fn test_attach_waits_for_upstream_connack() {
    let mut session = Session::new(founding(), UPSTREAM, 10);
    let mut ctx = Outbox::default();

    assert!(session.attach(&mut ctx, A, &founding()));
    assert!(session.attach(&mut ctx, B, &founding()));
    assert!(ops(&mut ctx).is_empty());
    assert!(session.members().is_empty());

    session.upstream_connack(&mut ctx, accepted());
    assert_eq!(
        ops(&mut ctx),
        vec![
            Op::Send(A, accepted().into()),
            Op::Send(B, accepted().into()),
        ]
    );
    assert_eq!(session.members(), vec![A, B]);
}

#[test]
fn test_attach_after_connack_gets_cached_connack() {
    let mut session = Session::new(founding(), UPSTREAM, 10);
    let mut ctx = Outbox::default();
    let ack = ConnAck {
        session_present: true,
        return_code: ConnectReturnCode::Accepted,
    };
    session.upstream_connack(&mut ctx, ack);

    assert!(session.attach(&mut ctx, A, &founding()));
    assert_eq!(ops(&mut ctx), vec![Op::Send(A, ack.into())]);
}

#[test]
fn test_password_mismatch_is_bad_credentials() {
    let (mut session, mut ctx) = connected(10, &[A]);

    let mut wrong = founding();
    wrong.password = Some(Bytes::from_static(b"not-P"));
    assert!(!session.attach(&mut ctx, B, &wrong));
    assert_eq!(
        ops(&mut ctx),
        vec![Op::Send(B, connack(ConnectReturnCode::BadCredentials))]
    );

    assert!(session.attach(&mut ctx, C, &founding()));
    assert_eq!(ops(&mut ctx), vec![Op::Send(C, accepted().into())]);
    assert_eq!(session.members(), vec![A, C]);
}

#[test]
fn test_username_presence_is_checked() {
    let (mut session, mut ctx) = connected(10, &[]);
    let mut anonymous = founding();
    anonymous.username = None;
    anonymous.password = None;

    assert!(!session.attach(&mut ctx, A, &anonymous));
    assert_eq!(
        ops(&mut ctx),
        vec![Op::Send(A, connack(ConnectReturnCode::BadCredentials))]
    );
}

#[test]
fn test_mismatched_fields_are_rejected_with_other() {
    let mut clean = founding();
    clean.clean_session = true;

    let mut version = founding();
    version.protocol_version = 4;

    let mut will = founding();
    will.will = Some(Will {
        topic: "last/words".into(),
        message: Bytes::from_static(b"bye"),
        qos: QoS::AtMostOnce,
        retain: false,
    });

    for connect in [clean, version, will] {
        let (mut session, mut ctx) = connected(10, &[]);
        assert!(!session.attach(&mut ctx, A, &connect));
        assert_eq!(
            ops(&mut ctx),
            vec![Op::Send(A, connack(ConnectReturnCode::Other))]
        );
    }
}

#[test]
fn test_rejection_does_not_wait_for_upstream() {
    let mut session = Session::new(founding(), UPSTREAM, 10);
    let mut ctx = Outbox::default();
    let mut clean = founding();
    clean.clean_session = true;

    assert!(!session.attach(&mut ctx, A, &clean));
    assert_eq!(
        ops(&mut ctx),
        vec![Op::Send(A, connack(ConnectReturnCode::Other))]
    );
}

#[test]
fn test_refused_upstream_is_passed_on() {
    let mut session = Session::new(founding(), UPSTREAM, 10);
    let mut ctx = Outbox::default();
    session.attach(&mut ctx, A, &founding());

    session.upstream_connack(&mut ctx, ConnAck::new(ConnectReturnCode::NotAuthorized));
    assert_eq!(
        ops(&mut ctx),
        vec![Op::Send(A, connack(ConnectReturnCode::NotAuthorized))]
    );
    assert!(session.is_closing());

    assert!(!session.attach(&mut ctx, B, &founding()));
    assert!(ops(&mut ctx).is_empty());
}

#[test]
fn test_upstream_failure_before_connack() {
    let mut session = Session::new(founding(), UPSTREAM, 10);
    let mut ctx = Outbox::default();
    session.attach(&mut ctx, A, &founding());

    session.upstream_closed(&mut ctx);
    assert_eq!(
        ops(&mut ctx),
        vec![Op::Send(A, connack(ConnectReturnCode::ServerUnavailable))]
    );
    assert!(session.is_finished());
}

#[test]
fn test_downstream_publish_is_remapped() {
    let (mut session, mut ctx) = connected(10, &[A, B]);

    session.forward_upstream(&mut ctx, A, publish(77, "a").into());
    session.forward_upstream(&mut ctx, B, publish(77, "b").into());
    assert_eq!(
        delivered(&ops(&mut ctx)),
        vec![(UPSTREAM, 1, "a".into()), (UPSTREAM, 2, "b".into())]
    );
    assert_eq!(session.in_flight(), 2);

    session.upstream_ack(&mut ctx, PubAck::new(2).into());
    session.upstream_ack(&mut ctx, PubAck::new(1).into());
    assert_eq!(
        ops(&mut ctx),
        vec![
            Op::Send(B, PubAck::new(77).into()),
            Op::Send(A, PubAck::new(77).into()),
        ]
    );
    assert_eq!(session.in_flight(), 0);
}

#[test]
fn test_qos0_publish_is_fire_and_forget() {
    let (mut session, mut ctx) = connected(1, &[A]);
    let qos0 = Publish {
        topic: Arc::from("t"),
        ..Default::default()
    };

    session.forward_upstream(&mut ctx, A, qos0.clone().into());
    assert_eq!(ops(&mut ctx), vec![Op::Send(UPSTREAM, qos0.into())]);
    assert_eq!(session.in_flight(), 0);
    assert!(!session.is_paused());
}

#[test]
fn test_duplicate_downstream_publish_is_not_forwarded_twice() {
    let (mut session, mut ctx) = connected(10, &[A]);

    session.forward_upstream(&mut ctx, A, publish(5, "t").into());
    let mut again = publish(5, "t");
    again.dup = true;
    session.forward_upstream(&mut ctx, A, again.into());

    assert_eq!(delivered(&ops(&mut ctx)).len(), 1);
    assert_eq!(session.in_flight(), 1);
}

#[test]
fn test_subscribe_is_remapped() {
    let (mut session, mut ctx) = connected(10, &[A]);
    let subscribe = Subscribe {
        dup: false,
        message_id: 9,
        subscriptions: vec![Subscription {
            topic: "a/+".into(),
            qos: QoS::AtLeastOnce,
        }],
    };

    session.forward_upstream(&mut ctx, A, subscribe.clone().into());
    let forwarded = Subscribe {
        message_id: 1,
        ..subscribe
    };
    assert_eq!(ops(&mut ctx), vec![Op::Send(UPSTREAM, forwarded.into())]);

    let suback = SubAck {
        message_id: 1,
        granted: vec![QoS::AtLeastOnce],
    };
    session.upstream_ack(&mut ctx, suback.into());
    let expected = SubAck {
        message_id: 9,
        granted: vec![QoS::AtLeastOnce],
    };
    assert_eq!(ops(&mut ctx), vec![Op::Send(A, expected.into())]);
}

#[test]
fn test_flow_control_pauses_and_resumes_all_members() {
    let (mut session, mut ctx) = connected(1, &[A, B]);

    session.forward_upstream(&mut ctx, A, publish(3, "t").into());
    let produced = ops(&mut ctx);
    assert_eq!(delivered(&produced), vec![(UPSTREAM, 1, "t".into())]);
    assert_eq!(&produced[1..], &[Op::Pause(A), Op::Pause(B)]);
    assert!(session.is_paused());

    session.upstream_ack(&mut ctx, PubAck::new(1).into());
    assert_eq!(
        ops(&mut ctx),
        vec![
            Op::Send(A, PubAck::new(3).into()),
            Op::Resume(A),
            Op::Resume(B),
        ]
    );
    assert!(!session.is_paused());
}

#[test]
fn test_member_joining_paused_session_is_paused() {
    let (mut session, mut ctx) = connected(1, &[A]);
    session.forward_upstream(&mut ctx, A, publish(3, "t").into());
    ctx.take();

    assert!(session.attach(&mut ctx, B, &founding()));
    assert_eq!(
        ops(&mut ctx),
        vec![Op::Send(B, accepted().into()), Op::Pause(B)]
    );
}

#[test]
fn test_upstream_publishes_fan_out_round_robin() {
    let (mut session, mut ctx) = connected(10, &[A, B]);

    for id in 10..16 {
        session.upstream_publish(&mut ctx, publish(id, &format!("m{}", id)));
    }
    assert_eq!(
        delivered(&ops(&mut ctx)),
        vec![
            (A, 1, "m10".into()),
            (B, 1, "m11".into()),
            (A, 2, "m12".into()),
            (B, 2, "m13".into()),
            (A, 3, "m14".into()),
            (B, 3, "m15".into()),
        ]
    );

    session.downstream_puback(&mut ctx, A, PubAck::new(2));
    session.downstream_puback(&mut ctx, B, PubAck::new(1));
    session.downstream_puback(&mut ctx, B, PubAck::new(3));
    assert_eq!(
        ops(&mut ctx),
        vec![
            Op::Send(UPSTREAM, PubAck::new(12).into()),
            Op::Send(UPSTREAM, PubAck::new(11).into()),
            Op::Send(UPSTREAM, PubAck::new(15).into()),
        ]
    );
    assert_eq!(session.pending_deliveries().len(), 3);
}

#[test]
fn test_broker_resend_goes_to_same_member() {
    let (mut session, mut ctx) = connected(10, &[A, B]);
    session.upstream_publish(&mut ctx, publish(10, "t"));
    ctx.take();

    let mut resend = publish(10, "t");
    resend.dup = true;
    session.upstream_publish(&mut ctx, resend);

    let produced = ops(&mut ctx);
    assert_eq!(delivered(&produced), vec![(A, 1, "t".into())]);
    assert!(matches!(&produced[0], Op::Send(_, Message::Publish(p)) if p.dup));
}

#[test]
fn test_departure_retargets_unacknowledged_deliveries() {
    let (mut session, mut ctx) = connected(10, &[A, B]);
    session.upstream_publish(&mut ctx, publish(10, "first"));
    session.upstream_publish(&mut ctx, publish(11, "second"));
    ctx.take();

    session.detach(&mut ctx, A);
    let produced = ops(&mut ctx);
    assert_eq!(delivered(&produced), vec![(B, 2, "first".into())]);
    assert!(matches!(&produced[0], Op::Send(_, Message::Publish(p)) if p.dup));

    let pending = session.pending_deliveries();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|p| p.owner == B));

    session.downstream_puback(&mut ctx, B, PubAck::new(2));
    assert_eq!(
        ops(&mut ctx),
        vec![Op::Send(UPSTREAM, PubAck::new(10).into())]
    );
}

#[test]
fn test_ack_for_departed_member_is_dropped() {
    let (mut session, mut ctx) = connected(10, &[A, B]);
    session.forward_upstream(&mut ctx, A, publish(4, "t").into());
    session.detach(&mut ctx, A);
    ctx.take();

    session.upstream_ack(&mut ctx, PubAck::new(1).into());
    assert!(ops(&mut ctx).is_empty());
    assert_eq!(session.in_flight(), 0);
}

#[test]
fn test_last_member_departure_disconnects_upstream() {
    let (mut session, mut ctx) = connected(10, &[A]);

    session.detach(&mut ctx, A);
    assert_eq!(ops(&mut ctx), vec![Op::Send(UPSTREAM, Message::Disconnect)]);
    assert!(session.is_closing());
    assert!(!session.is_finished());

    assert!(!session.attach(&mut ctx, B, &founding()));
    assert!(ops(&mut ctx).is_empty());

    session.upstream_closed(&mut ctx);
    assert!(ops(&mut ctx).is_empty());
    assert!(session.is_finished());
}

#[test]
fn test_last_waiting_channel_departure_closes_upstream() {
    let mut session = Session::new(founding(), UPSTREAM, 10);
    let mut ctx = Outbox::default();
    session.attach(&mut ctx, A, &founding());

    session.detach(&mut ctx, A);
    assert_eq!(ops(&mut ctx), vec![Op::Close(UPSTREAM)]);
    assert!(session.is_closing());
}

#[test]
fn test_upstream_departure_closes_members() {
    let (mut session, mut ctx) = connected(10, &[A, B]);

    session.upstream_closed(&mut ctx);
    assert_eq!(ops(&mut ctx), vec![Op::Close(A), Op::Close(B)]);
    assert!(session.is_finished());

    session.detach(&mut ctx, A);
    assert!(ops(&mut ctx).is_empty());
    assert!(!session.attach(&mut ctx, C, &founding()));
}

#[test]
fn test_round_robin_cursor_survives_departure() {
    let (mut session, mut ctx) = connected(10, &[A, B, C]);
    session.upstream_publish(&mut ctx, publish(1, "to-a"));
    session.upstream_publish(&mut ctx, publish(2, "to-b"));
    session.downstream_puback(&mut ctx, A, PubAck::new(1));
    session.downstream_puback(&mut ctx, B, PubAck::new(1));
    ctx.take();

    session.detach(&mut ctx, A);
    session.upstream_publish(&mut ctx, publish(3, "next"));
    assert_eq!(delivered(&ops(&mut ctx)), vec![(C, 1, "next".into())]);
}
