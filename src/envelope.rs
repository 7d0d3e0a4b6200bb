/// Headers and payload handed from the relay to a transport.
///
/// The relay publishes `Envelope<MessageHeaders, RawPayload>`
/// ([`Outbound`](crate::transport::Outbound)): the headers carry the message
/// id, routing data and business key, the payload is the serialized bytes
/// stored in the outbox. Tower layers may rewrite the payload (see the
/// `cloud-events` feature) but must keep the headers, since the message id
/// is what consumers deduplicate on.
///
/// ## Conversion
///
/// `Envelope` implements `From<(H, M)>` for ergonomic construction when headers
/// and payload are already available as a tuple.
///
/// ## Example
///
/// ```rust
/// use courier::Envelope;
///
/// let envelope = Envelope {
///     headers: "order.created",
///     message: br#"{"order_no":"ORD-1"}"#.to_vec(),
/// };
///
/// // or, equivalently
/// let same: Envelope<_, _> = ("order.created", envelope.message.clone()).into();
/// assert_eq!(envelope, same);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<H, M> {
    /// Message metadata.
    pub headers: H,
    /// Message payload.
    pub message: M,
}

impl<H, M> From<(H, M)> for Envelope<H, M> {
    fn from(value: (H, M)) -> Self {
        Envelope {
            headers: value.0,
            message: value.1,
        }
    }
}
