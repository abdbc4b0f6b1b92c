//! Pure message routing logic for MQTT events
//!
//! Turns rumqttc events into [`EventRoute`]s and decides which protocol
//! handler an inbound message belongs to.

use super::connection::ConnectStatus;
use super::topic::{ProtocolTopics, TopicKind};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::Packet as MqttPacket;
use rumqttc::v5::{mqttbytes::QoS, Event};

/// An inbound message as delivered to raw subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

impl Packet {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }
}

/// Routing decisions for connection events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker answered a connection attempt
    ConnectionAcknowledged(ConnectStatus),
    /// Message received on a subscribed topic
    MessageReceived(Packet),
    /// Broker closed the session
    Disconnected,
    /// The connection attempt or the session failed
    ConnectionError(String),
    /// Pings, acks and outgoing traffic
    Other,
}

/// Which protocol handler an inbound message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound<'a> {
    Leave,
    Discover,
    /// Announcement for the contained device topic
    Announce(&'a str),
    /// Plain subscription traffic
    Data,
}

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route a rumqttc v5 event
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                MqttPacket::ConnAck(connack) => {
                    EventRoute::ConnectionAcknowledged(ConnectStatus::from_return_code(connack.code))
                }
                MqttPacket::Publish(publish) => EventRoute::MessageReceived(Packet {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                }),
                MqttPacket::Disconnect(_) => EventRoute::Disconnected,
                _ => EventRoute::Other,
            },
            Event::Outgoing(_) => EventRoute::Other,
        }
    }

    /// Route a failed poll of the rumqttc event loop
    pub fn route_connection_error(error: &rumqttc::v5::ConnectionError) -> EventRoute {
        use rumqttc::v5::ConnectionError;
        match error {
            ConnectionError::ConnectionRefused(code) => {
                EventRoute::ConnectionAcknowledged(ConnectStatus::from_return_code(*code))
            }
            other => EventRoute::ConnectionError(other.to_string()),
        }
    }

    /// Classify an inbound topic against the protocol topics
    pub fn classify<'a>(topic: &'a str, topics: &ProtocolTopics) -> Inbound<'a> {
        if topic == topics.name(TopicKind::Leave) {
            Inbound::Leave
        } else if topic == topics.name(TopicKind::Discover) {
            Inbound::Discover
        } else if let Some(device) = topics.device_from_announce(topic) {
            Inbound::Announce(device)
        } else {
            Inbound::Data
        }
    }

    /// Retained messages use QoS 1, everything else QoS 0
    pub fn determine_qos_level(retain: bool) -> QoS {
        match retain {
            true => QoS::AtLeastOnce,
            false => QoS::AtMostOnce,
        }
    }

    /// QoS used for every subscription
    pub fn subscription_qos() -> QoS {
        QoS::AtLeastOnce
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::connection::ConnectCode;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, Publish,
    };

    #[test]
    fn test_route_mqtt_event() {
        let connack = Event::Incoming(MqttPacket::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged(ConnectStatus::success())
        );

        let disconnect = Event::Incoming(MqttPacket::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        );

        let publish = Event::Incoming(MqttPacket::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: Bytes::from("announce/lights/lamp"),
            pkid: 1,
            payload: Bytes::from("{}"),
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&publish),
            EventRoute::MessageReceived(Packet::new("announce/lights/lamp", "{}", true))
        );
    }

    #[test]
    fn test_refused_connack() {
        let connack = Event::Incoming(MqttPacket::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::BadUserNamePassword,
            properties: None,
        }));
        match MessageHandler::route_mqtt_event(&connack) {
            EventRoute::ConnectionAcknowledged(status) => {
                assert_eq!(status.code, ConnectCode::Refused);
            }
            other => panic!("Expected ConnectionAcknowledged, got {other:?}"),
        }
    }

    #[test]
    fn test_classify() {
        let topics = ProtocolTopics::default();
        assert_eq!(MessageHandler::classify("leave", &topics), Inbound::Leave);
        assert_eq!(
            MessageHandler::classify("discover", &topics),
            Inbound::Discover
        );
        assert_eq!(
            MessageHandler::classify("announce/lights/lamp", &topics),
            Inbound::Announce("lights/lamp")
        );
        assert_eq!(
            MessageHandler::classify("lights/lamp/on/get", &topics),
            Inbound::Data
        );
        assert_eq!(
            MessageHandler::classify("leave/extra", &topics),
            Inbound::Data
        );
    }

    #[test]
    fn test_determine_qos_level() {
        assert_eq!(MessageHandler::determine_qos_level(true), QoS::AtLeastOnce);
        assert_eq!(MessageHandler::determine_qos_level(false), QoS::AtMostOnce);
        assert_eq!(MessageHandler::subscription_qos(), QoS::AtLeastOnce);
    }
}
