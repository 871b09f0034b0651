//! The three-step PKI-DH handshake.
//!
//! Roles follow GUID order: the participant with the numerically smaller
//! GUID sends the request, the other replies, the requester finishes with
//! the final message. Each side ends up with the same shared secret,
//! SHA-256 of the raw Diffie-Hellman agreement.

use std::cmp::Ordering;

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  create_security_error_and_log,
  security::{
    authentication::{
      Challenge, HandshakeHandle, IdentityHandle, SharedSecretHandle, ValidationOutcome,
    },
    certificate::{Certificate, CertificateRevocationList, Sha256},
    config::{read_uri, read_uri_to_private_key, ConfigError},
    security_error,
    types::{
      serialize_binary_properties, AuthenticatedPeerCredentialToken, BinaryProperty,
      HandshakeMessageToken, IdentityToken,
    },
    SecurityResult,
  },
  structure::guid::{GuidPrefix, GUID},
};
use super::{
  adjusted_guid_from_certificate,
  dh::{DHKeys, KeyAgreementKind},
  participant_guid_from_pdata,
  types::{
    parse_signature_algo_name_to_ring, BuiltinHandshakeMessageToken, BuiltinIdentityToken,
    CertificateAlgorithm, HANDSHAKE_FINAL_CLASS_ID, HANDSHAKE_REPLY_CLASS_ID,
    HANDSHAKE_REQUEST_CLASS_ID, IDENTITY_TOKEN_CLASS_ID,
  },
  validate_remote_guid, AuthenticationBuiltin, AuthenticationConfig, BuiltinHandshakeState,
  LocalParticipantInfo, RemoteParticipantInfo,
};

/// Builds the byte string hashed into hash(C1) / hash(C2): the CDR image
/// of the identity-bearing token fields.
fn c_properties_image(
  id_pem: &Bytes,
  permissions: &Bytes,
  pdata: &Bytes,
  dsign_algo: &Bytes,
  kagree_algo: &Bytes,
) -> Vec<u8> {
  serialize_binary_properties(&[
    BinaryProperty::with_propagate("c.id", id_pem.clone()),
    BinaryProperty::with_propagate("c.perm", permissions.clone()),
    BinaryProperty::with_propagate("c.pdata", pdata.clone()),
    BinaryProperty::with_propagate("c.dsign_algo", dsign_algo.clone()),
    BinaryProperty::with_propagate("c.kagree_algo", kagree_algo.clone()),
  ])
}

/// The byte string signed in the reply:
/// Hash(C2) | Challenge2 | DH2 | Challenge1 | DH1 | Hash(C1).
fn reply_signature_image(
  hash_c2: &[u8],
  challenge2: &[u8],
  dh2: &[u8],
  challenge1: &[u8],
  dh1: &[u8],
  hash_c1: &[u8],
) -> Vec<u8> {
  serialize_binary_properties(&[
    BinaryProperty::with_propagate("hash_c2", Bytes::copy_from_slice(hash_c2)),
    BinaryProperty::with_propagate("challenge2", Bytes::copy_from_slice(challenge2)),
    BinaryProperty::with_propagate("dh2", Bytes::copy_from_slice(dh2)),
    BinaryProperty::with_propagate("challenge1", Bytes::copy_from_slice(challenge1)),
    BinaryProperty::with_propagate("dh1", Bytes::copy_from_slice(dh1)),
    BinaryProperty::with_propagate("hash_c1", Bytes::copy_from_slice(hash_c1)),
  ])
}

/// The byte string signed in the final message:
/// Hash(C1) | Challenge1 | DH1 | Challenge2 | DH2 | Hash(C2).
fn final_signature_image(
  hash_c1: &[u8],
  challenge1: &[u8],
  dh1: &[u8],
  challenge2: &[u8],
  dh2: &[u8],
  hash_c2: &[u8],
) -> Vec<u8> {
  serialize_binary_properties(&[
    BinaryProperty::with_propagate("hash_c1", Bytes::copy_from_slice(hash_c1)),
    BinaryProperty::with_propagate("challenge1", Bytes::copy_from_slice(challenge1)),
    BinaryProperty::with_propagate("dh1", Bytes::copy_from_slice(dh1)),
    BinaryProperty::with_propagate("challenge2", Bytes::copy_from_slice(challenge2)),
    BinaryProperty::with_propagate("dh2", Bytes::copy_from_slice(dh2)),
    BinaryProperty::with_propagate("hash_c2", Bytes::copy_from_slice(hash_c2)),
  ])
}

impl AuthenticationBuiltin {
  /// Loads and checks the local identity documents, and derives the
  /// adjusted participant GUID from the identity certificate.
  ///
  /// Certificate load failures distinguish an unsupported URI scheme from
  /// a verification failure in the error message.
  pub fn validate_local_identity(
    &mut self,
    config: &AuthenticationConfig,
    candidate_participant_guid: GUID,
  ) -> SecurityResult<(ValidationOutcome, IdentityHandle, GUID)> {
    let identity_ca = read_uri(&config.identity_ca)
      .map_err(|e| config_error_to_security("identity CA certificate", &config.identity_ca, e))
      .and_then(Certificate::from_pem)?;

    let identity_certificate = read_uri(&config.identity_certificate)
      .map_err(|e| {
        config_error_to_security("identity certificate", &config.identity_certificate, e)
      })
      .and_then(Certificate::from_pem)?;

    let crl = match &config.identity_crl {
      Some(crl_uri) => {
        let crl_doc = read_uri(crl_uri)
          .map_err(|e| config_error_to_security("certificate revocation list", crl_uri, e))?;
        Some(CertificateRevocationList::from_pem(crl_doc)?)
      }
      None => None,
    };

    // TODO: decrypt a password protected private key
    let _password = &config.password;

    let id_cert_private_key = read_uri_to_private_key(&config.private_key)
      .map_err(|e| config_error_to_security("private key", &config.private_key, e))?;

    // Verify that the CA has signed our identity, and that the identity
    // has not been revoked. An identity others would reject is useless.
    identity_certificate
      .verify_signed_by_certificate(&identity_ca)
      .map_err(|_e| {
        create_security_error_and_log!(
          "My own identity certificate does not verify against the identity CA."
        )
      })?;
    if let Some(crl) = &crl {
      if crl.is_revoked(&identity_certificate)? {
        return Err(create_security_error_and_log!(
          "My own identity certificate is revoked."
        ));
      }
    }

    let adjusted_guid =
      adjusted_guid_from_certificate(&identity_certificate, candidate_participant_guid)?;

    let certificate_algorithm = CertificateAlgorithm::from_certificate_key(
      identity_certificate.key_algorithm(),
    )?;
    let ca_algorithm = CertificateAlgorithm::from_certificate_key(identity_ca.key_algorithm())?;

    let identity_token = BuiltinIdentityToken {
      certificate_subject: identity_certificate.subject_name_string(),
      certificate_algorithm,
      ca_subject: identity_ca.subject_name_string(),
      ca_algorithm,
    };

    let kagree_kind = KeyAgreementKind::from_preference(
      config.preferred_key_agreement,
      ca_algorithm == CertificateAlgorithm::RsaSha256,
    );

    let local_identity_handle = self.get_new_identity_handle();

    self.local_participant_info = Some(LocalParticipantInfo {
      identity_handle: local_identity_handle,
      identity_token,
      guid: adjusted_guid,
      identity_certificate,
      id_cert_private_key,
      identity_ca,
      crl,
      signed_permissions_document: Bytes::new(), // filled in by set_permissions_credential
      kagree_kind,
      transmit_algorithms_as_legacy: config.transmit_algorithms_as_legacy,
    });

    // Insert a completed self-handshake so that a participant's own
    // identity handle resolves to a shared secret like any remote's.
    let self_info = RemoteParticipantInfo {
      identity_certificate: None,
      signed_permissions_document: None,
      handshake_state: BuiltinHandshakeState::CompletedWithFinalMessageReceived {
        challenge1: Challenge::from(self.generate_random_32_bytes()?),
        challenge2: Challenge::from(self.generate_random_32_bytes()?),
        shared_secret: crate::security::authentication::SharedSecret::from(
          self.generate_random_32_bytes()?,
        ),
      },
    };
    self
      .remote_participant_infos
      .insert(local_identity_handle, self_info);

    Ok((ValidationOutcome::Ok, local_identity_handle, adjusted_guid))
  }

  pub fn get_identity_token(&self, handle: IdentityHandle) -> SecurityResult<IdentityToken> {
    let local_info = self.get_local_participant_info()?;
    if handle != local_info.identity_handle {
      return Err(create_security_error_and_log!(
        "The given handle does not correspond to the local identity handle"
      ));
    }
    Ok(
      local_info
        .identity_token
        .to_token(local_info.transmit_algorithms_as_legacy),
    )
  }

  /// Stores the signed permissions document that travels as c.perm.
  pub fn set_permissions_credential(
    &mut self,
    handle: IdentityHandle,
    signed_permissions_document: Bytes,
  ) -> SecurityResult<()> {
    let local_info = self.get_local_participant_info_mutable()?;
    if handle != local_info.identity_handle {
      return Err(create_security_error_and_log!(
        "The parameter handle is not the local identity handle"
      ));
    }
    local_info.signed_permissions_document = signed_permissions_document;
    Ok(())
  }

  /// Starts authentication with a newly discovered participant. Decides
  /// the handshake role from GUID order: the smaller GUID requests.
  pub fn validate_remote_identity(
    &mut self,
    local_identity_handle: IdentityHandle,
    remote_identity_token: &IdentityToken,
    remote_participant_guid_prefix: GuidPrefix,
  ) -> SecurityResult<(ValidationOutcome, IdentityHandle)> {
    let local_info = self.get_local_participant_info()?;
    if local_identity_handle != local_info.identity_handle {
      return Err(create_security_error_and_log!(
        "The parameter local_identity_handle is not the correct local handle"
      ));
    }

    if remote_identity_token.class_id() != IDENTITY_TOKEN_CLASS_ID {
      return Err(create_security_error_and_log!(
        "Remote identity class_id is {:?}",
        remote_identity_token.class_id()
      ));
    }

    let (handshake_state, validation_outcome) =
      match local_info.guid.prefix.cmp(&remote_participant_guid_prefix) {
        Ordering::Less => (
          // Our GUID is lower: we send the request.
          BuiltinHandshakeState::PendingRequestSend,
          ValidationOutcome::PendingHandshakeRequest,
        ),
        Ordering::Greater => (
          // Our GUID is higher: we wait for the remote's request.
          BuiltinHandshakeState::PendingRequestMessage,
          ValidationOutcome::PendingHandshakeMessage,
        ),
        Ordering::Equal => {
          return Err(create_security_error_and_log!(
            "Remote GUID is equal to the local GUID"
          ));
        }
      };

    let remote_identity_handle = self.get_new_identity_handle();
    self.remote_participant_infos.insert(
      remote_identity_handle,
      RemoteParticipantInfo {
        identity_certificate: None,
        signed_permissions_document: None,
        handshake_state,
      },
    );

    Ok((validation_outcome, remote_identity_handle))
  }

  /// Requester side, step one: produce the `+Req` token.
  pub fn begin_handshake_request(
    &mut self,
    initiator_identity_handle: IdentityHandle, // local
    replier_identity_handle: IdentityHandle,   // remote
    serialized_local_participant_data: Vec<u8>,
  ) -> SecurityResult<(ValidationOutcome, HandshakeHandle, HandshakeMessageToken)> {
    let local_info = self.get_local_participant_info()?;
    if initiator_identity_handle != local_info.identity_handle {
      return Err(create_security_error_and_log!(
        "The parameter initiator_identity_handle is not the correct local handle"
      ));
    }
    let my_id_certificate_text = Bytes::from(local_info.identity_certificate.to_pem());
    let my_permissions_doc_text = local_info.signed_permissions_document.clone();

    let remote_info = self.get_remote_participant_info(&replier_identity_handle)?;
    if !matches!(
      remote_info.handshake_state,
      BuiltinHandshakeState::PendingRequestSend
    ) {
      return Err(create_security_error_and_log!(
        "Not expecting to send a handshake request. Handshake state: {:?}",
        remote_info.handshake_state
      ));
    }

    // The requester picks the key agreement algorithm.
    let dh_keys = DHKeys::new(local_info.kagree_kind, &self.secure_random_generator)?;

    let pdata_bytes = Bytes::from(serialized_local_participant_data);
    let dsign_algo = Bytes::from_static(
      CertificateAlgorithm::from_certificate_key(
        local_info.identity_certificate.key_algorithm(),
      )?
      .dsign_algo_name(local_info.transmit_algorithms_as_legacy)
      .as_bytes(),
    );
    let kagree_algo = Bytes::from_static(dh_keys.kagree_algo_name_str().as_bytes());

    let hash_c1 = Sha256::hash(&c_properties_image(
      &my_id_certificate_text,
      &my_permissions_doc_text,
      &pdata_bytes,
      &dsign_algo,
      &kagree_algo,
    ));

    let challenge1 = Challenge::from(self.generate_random_32_bytes()?);
    let dh1_public = dh_keys.public_key_bytes()?;

    let handshake_request = BuiltinHandshakeMessageToken {
      class_id: HANDSHAKE_REQUEST_CLASS_ID.to_string(),
      c_id: Some(my_id_certificate_text),
      c_perm: Some(my_permissions_doc_text),
      c_pdata: Some(pdata_bytes),
      c_dsign_algo: Some(dsign_algo),
      c_kagree_algo: Some(kagree_algo),
      hash_c1: Some(Bytes::copy_from_slice(hash_c1.as_ref())),
      dh1: Some(dh1_public),
      challenge1: Some(Bytes::copy_from_slice(challenge1.as_ref())),
      ..Default::default()
    };

    let remote_info = self.get_remote_participant_info_mutable(&replier_identity_handle)?;
    remote_info.handshake_state = BuiltinHandshakeState::PendingReplyMessage {
      dh1: dh_keys,
      challenge1,
      hash_c1,
    };

    let new_handshake_handle = self.get_new_handshake_handle();
    self
      .handshake_to_identity_handle_map
      .insert(new_handshake_handle, replier_identity_handle);

    Ok((
      ValidationOutcome::PendingHandshakeMessage,
      new_handshake_handle,
      handshake_request.into(),
    ))
  }

  /// Replier side, step two: validate the request and produce the `+Reply`
  /// token.
  pub fn begin_handshake_reply(
    &mut self,
    handshake_message_in: HandshakeMessageToken,
    initiator_identity_handle: IdentityHandle, // remote
    replier_identity_handle: IdentityHandle,   // local
    serialized_local_participant_data: Vec<u8>,
  ) -> SecurityResult<(ValidationOutcome, HandshakeHandle, HandshakeMessageToken)> {
    let local_info = self.get_local_participant_info()?;
    if replier_identity_handle != local_info.identity_handle {
      return Err(create_security_error_and_log!(
        "The parameter replier_identity_handle is not the correct local handle"
      ));
    }
    let my_id_certificate_text = Bytes::from(local_info.identity_certificate.to_pem());
    let my_permissions_doc_text = local_info.signed_permissions_document.clone();

    let remote_info = self.get_remote_participant_info(&initiator_identity_handle)?;
    if !matches!(
      remote_info.handshake_state,
      BuiltinHandshakeState::PendingRequestMessage
    ) {
      return Err(create_security_error_and_log!(
        "Not expecting to receive a handshake request. Handshake state: {:?}",
        remote_info.handshake_state
      ));
    }

    let request =
      BuiltinHandshakeMessageToken::try_from(handshake_message_in)?.extract_request()?;

    // The requester's certificate must chain to our CA and must not be
    // revoked.
    let cert1 = Certificate::from_pem(request.c_id.as_ref())?;
    cert1.verify_signed_by_certificate(&local_info.identity_ca)?;
    if let Some(crl) = &local_info.crl {
      if crl.is_revoked(&cert1)? {
        return Err(create_security_error_and_log!(
          "Handshake request certificate is revoked"
        ));
      }
    }

    // The GUID inside c.pdata must carry the certificate binding.
    let remote_guid = participant_guid_from_pdata(&request.c_pdata)?;
    validate_remote_guid(remote_guid, &cert1).map_err(|e| {
      create_security_error_and_log!("Remote GUID does not comply with the spec: {e}")
    })?;

    // Algorithm whitelists.
    let requester_algorithm = CertificateAlgorithm::parse(
      std::str::from_utf8(&request.c_dsign_algo)
        .map_err(|_| security_error("c.dsign_algo is not UTF-8"))?,
    )?;
    let kagree_kind = KeyAgreementKind::from_algo_name(&request.c_kagree_algo)?;
    // cross-check the announced signature algorithm against the certificate
    if CertificateAlgorithm::from_certificate_key(cert1.key_algorithm())? != requester_algorithm {
      return Err(create_security_error_and_log!(
        "c.dsign_algo does not match the requester's certificate"
      ));
    }

    // The requester chose the key agreement; we follow.
    let dh2_keys = DHKeys::new(kagree_kind, &self.secure_random_generator)?;
    let kagree_algo = Bytes::copy_from_slice(&request.c_kagree_algo);

    // Reproduce hash(C1) and check it against the transmitted copy.
    let computed_c1_hash = Sha256::hash(&c_properties_image(
      &request.c_id,
      &request.c_perm,
      &request.c_pdata,
      &request.c_dsign_algo,
      &request.c_kagree_algo,
    ));
    match &request.hash_c1 {
      Some(received_hash_c1) => {
        if computed_c1_hash != *received_hash_c1 {
          return Err(create_security_error_and_log!(
            "begin_handshake_reply: hash_c1 mismatch"
          ));
        }
      }
      None => {
        info!("Handshake request carried no hash_c1; nothing to compare.");
      }
    }

    let challenge2 = Challenge::from(self.generate_random_32_bytes()?);
    let dh2_public = dh2_keys.public_key_bytes()?;

    let my_dsign_algo = Bytes::from_static(
      CertificateAlgorithm::from_certificate_key(
        local_info.identity_certificate.key_algorithm(),
      )?
      .dsign_algo_name(local_info.transmit_algorithms_as_legacy)
      .as_bytes(),
    );
    let pdata_bytes = Bytes::from(serialized_local_participant_data);

    let c2_hash = Sha256::hash(&c_properties_image(
      &my_id_certificate_text,
      &my_permissions_doc_text,
      &pdata_bytes,
      &my_dsign_algo,
      &kagree_algo,
    ));

    let signature = local_info.id_cert_private_key.sign(&reply_signature_image(
      c2_hash.as_ref(),
      challenge2.as_ref(),
      &dh2_public,
      &request.challenge1,
      &request.dh1,
      computed_c1_hash.as_ref(),
    ))?;

    let reply_token = BuiltinHandshakeMessageToken {
      class_id: HANDSHAKE_REPLY_CLASS_ID.to_string(),
      c_id: Some(my_id_certificate_text),
      c_perm: Some(my_permissions_doc_text),
      c_pdata: Some(pdata_bytes),
      c_dsign_algo: Some(my_dsign_algo),
      c_kagree_algo: Some(kagree_algo),
      // the hash we computed, not as received
      hash_c1: Some(Bytes::copy_from_slice(computed_c1_hash.as_ref())),
      dh1: Some(request.dh1.clone()),
      hash_c2: Some(Bytes::copy_from_slice(c2_hash.as_ref())),
      dh2: Some(dh2_public),
      challenge1: Some(request.challenge1.clone()),
      challenge2: Some(Bytes::copy_from_slice(challenge2.as_ref())),
      signature: Some(signature),
    };

    let challenge1 = Challenge::from(
      <[u8; 32]>::try_from(request.challenge1.as_ref())
        .map_err(|_| security_error("challenge1 is not 32 bytes"))?,
    );

    let remote_info = self.get_remote_participant_info_mutable(&initiator_identity_handle)?;
    remote_info.handshake_state = BuiltinHandshakeState::PendingFinalMessage {
      hash_c1: computed_c1_hash,
      hash_c2: c2_hash,
      dh1_public: request.dh1,
      dh2: dh2_keys,
      challenge1,
      challenge2,
      remote_id_certificate: cert1.clone(),
    };
    remote_info.identity_certificate = Some(cert1);
    remote_info.signed_permissions_document = Some(request.c_perm);

    let new_handshake_handle = self.get_new_handshake_handle();
    self
      .handshake_to_identity_handle_map
      .insert(new_handshake_handle, initiator_identity_handle);

    Ok((
      ValidationOutcome::PendingHandshakeMessage,
      new_handshake_handle,
      reply_token.into(),
    ))
  }

  /// Advances the handshake with an incoming reply or final message.
  ///
  /// Any validation failure destroys the handshake handle; the caller
  /// restarts authentication from the beginning. No partial state
  /// survives a failure.
  pub fn process_handshake(
    &mut self,
    handshake_message_in: HandshakeMessageToken,
    handshake_handle: HandshakeHandle,
  ) -> SecurityResult<(ValidationOutcome, Option<HandshakeMessageToken>)> {
    let result = self.process_handshake_inner(handshake_message_in, handshake_handle);
    if result.is_err() {
      self.destroy_handshake(handshake_handle);
    }
    result
  }

  fn process_handshake_inner(
    &mut self,
    handshake_message_in: HandshakeMessageToken,
    handshake_handle: HandshakeHandle,
  ) -> SecurityResult<(ValidationOutcome, Option<HandshakeMessageToken>)> {
    let remote_identity_handle = *self.handshake_handle_to_identity_handle(&handshake_handle)?;
    let remote_info = self.get_remote_participant_info_mutable(&remote_identity_handle)?;

    // The states carry key pairs, which cannot be cloned. Move the state
    // out, leave a placeholder, and overwrite it before returning.
    let mut state = BuiltinHandshakeState::PendingRequestSend;
    std::mem::swap(&mut remote_info.handshake_state, &mut state);

    let was_requester = matches!(state, BuiltinHandshakeState::PendingReplyMessage { .. });
    let result = match state {
      BuiltinHandshakeState::PendingReplyMessage {
        dh1,
        challenge1,
        hash_c1,
      } => self.process_reply_message(
        handshake_message_in,
        remote_identity_handle,
        dh1,
        challenge1,
        hash_c1,
      ),
      BuiltinHandshakeState::PendingFinalMessage {
        hash_c1,
        hash_c2,
        dh1_public,
        dh2,
        challenge1,
        challenge2,
        remote_id_certificate,
      } => self.process_final_message(
        handshake_message_in,
        remote_identity_handle,
        hash_c1,
        hash_c2,
        dh1_public,
        dh2,
        challenge1,
        challenge2,
        remote_id_certificate,
      ),
      other_state => Err(create_security_error_and_log!(
        "Unexpected handshake state: {other_state:?}"
      )),
    };

    // Failure rolls the pair back to its role's initial state so
    // authentication can start over.
    if result.is_err() {
      if let Ok(remote_info) = self.get_remote_participant_info_mutable(&remote_identity_handle) {
        remote_info.handshake_state = if was_requester {
          BuiltinHandshakeState::PendingRequestSend
        } else {
          BuiltinHandshakeState::PendingRequestMessage
        };
        remote_info.identity_certificate = None;
        remote_info.signed_permissions_document = None;
      }
    }
    result
  }

  /// Requester receives the reply, verifies it, derives the secret, and
  /// produces the final message.
  fn process_reply_message(
    &mut self,
    handshake_message_in: HandshakeMessageToken,
    remote_identity_handle: IdentityHandle,
    dh1: DHKeys,
    challenge1: Challenge,
    hash_c1: Sha256,
  ) -> SecurityResult<(ValidationOutcome, Option<HandshakeMessageToken>)> {
    let local_info = self.get_local_participant_info()?;

    let reply = BuiltinHandshakeMessageToken::try_from(handshake_message_in)?.extract_reply()?;

    // The replier's certificate must chain to our CA and must not be
    // revoked.
    let cert2 = Certificate::from_pem(reply.c_id.as_ref())?;
    cert2.verify_signed_by_certificate(&local_info.identity_ca)?;
    if let Some(crl) = &local_info.crl {
      if crl.is_revoked(&cert2)? {
        return Err(create_security_error_and_log!(
          "Handshake reply certificate is revoked"
        ));
      }
    }

    // GUID binding check, same as the replier does for us.
    let remote_guid = participant_guid_from_pdata(&reply.c_pdata)?;
    validate_remote_guid(remote_guid, &cert2).map_err(|e| {
      create_security_error_and_log!("Remote GUID does not comply with the spec: {e}")
    })?;

    if challenge1.as_ref() != reply.challenge1.as_ref() {
      return Err(create_security_error_and_log!(
        "Challenge 1 mismatch on authentication reply"
      ));
    }

    if let Some(received_hash_c1) = &reply.hash_c1 {
      if hash_c1 != *received_hash_c1 {
        return Err(create_security_error_and_log!(
          "Hash C1 mismatch on authentication reply"
        ));
      }
    } else {
      debug!("Handshake reply carried no hash_c1; nothing to compare.");
    }

    // Recompute hash(C2) over the received identity fields.
    let c2_hash_recomputed = Sha256::hash(&c_properties_image(
      &reply.c_id,
      &reply.c_perm,
      &reply.c_pdata,
      &reply.c_dsign_algo,
      &reply.c_kagree_algo,
    ));
    if let Some(received_hash_c2) = &reply.hash_c2 {
      if c2_hash_recomputed != *received_hash_c2 {
        return Err(create_security_error_and_log!(
          "process_handshake: hash_c2 mismatch"
        ));
      }
    } else {
      debug!("Handshake reply carried no hash_c2; nothing to compare.");
    }

    // Verify the reply signature with the replier's public key.
    let c2_signature_algorithm = parse_signature_algo_name_to_ring(&reply.c_dsign_algo)?;
    cert2.verify_signed_data_with_algorithm(
      reply_signature_image(
        c2_hash_recomputed.as_ref(),
        &reply.challenge2,
        &reply.dh2,
        &reply.challenge1,
        &reply.dh1,
        hash_c1.as_ref(),
      ),
      &reply.signature,
      c2_signature_algorithm,
    )?;

    // The replier must have followed our key agreement choice.
    let kagree_in_reply = KeyAgreementKind::from_algo_name(&reply.c_kagree_algo)?;
    if kagree_in_reply != dh1.kind() {
      return Err(create_security_error_and_log!(
        "Unexpected key agreement algorithm {:?} in handshake reply, expected {:?}",
        kagree_in_reply,
        dh1.kind()
      ));
    }

    let dh1_public = dh1.public_key_bytes()?;

    let challenge2 = Challenge::from(
      <[u8; 32]>::try_from(reply.challenge2.as_ref())
        .map_err(|_| security_error("challenge2 is not 32 bytes"))?,
    );

    // Derive the secret, then sign the final contents.
    let shared_secret = dh1.compute_shared_secret(reply.dh2.clone())?;

    let final_signature = local_info.id_cert_private_key.sign(&final_signature_image(
      hash_c1.as_ref(),
      challenge1.as_ref(),
      &dh1_public,
      &reply.challenge2,
      &reply.dh2,
      c2_hash_recomputed.as_ref(),
    ))?;

    let final_token = BuiltinHandshakeMessageToken {
      class_id: HANDSHAKE_FINAL_CLASS_ID.to_string(),
      // the hashes and DH keys are optional in the final message; include
      // them so the peer can cross-check
      hash_c1: Some(Bytes::copy_from_slice(hash_c1.as_ref())),
      dh1: Some(dh1_public),
      hash_c2: Some(Bytes::copy_from_slice(c2_hash_recomputed.as_ref())),
      dh2: Some(reply.dh2),
      // only these three are mandatory
      challenge1: Some(reply.challenge1),
      challenge2: Some(Bytes::copy_from_slice(challenge2.as_ref())),
      signature: Some(final_signature),
      ..Default::default()
    };

    let remote_info = self.get_remote_participant_info_mutable(&remote_identity_handle)?;
    remote_info.handshake_state = BuiltinHandshakeState::CompletedWithFinalMessageSent {
      challenge1,
      challenge2,
      shared_secret,
    };
    remote_info.identity_certificate = Some(cert2);
    remote_info.signed_permissions_document = Some(reply.c_perm);

    Ok((
      ValidationOutcome::OkFinalMessage,
      Some(final_token.into()),
    ))
  }

  /// Replier receives the final message, verifies it against everything it
  /// remembered from the reply step, and derives the secret.
  #[allow(clippy::too_many_arguments)]
  fn process_final_message(
    &mut self,
    handshake_message_in: HandshakeMessageToken,
    remote_identity_handle: IdentityHandle,
    hash_c1: Sha256,
    hash_c2: Sha256,
    dh1_public: Bytes,
    dh2: DHKeys,
    challenge1: Challenge,
    challenge2: Challenge,
    remote_id_certificate: Certificate,
  ) -> SecurityResult<(ValidationOutcome, Option<HandshakeMessageToken>)> {
    let final_token =
      BuiltinHandshakeMessageToken::try_from(handshake_message_in)?.extract_final()?;

    if let Some(received_hash_c1) = &final_token.hash_c1 {
      if hash_c1 != *received_hash_c1 {
        return Err(create_security_error_and_log!(
          "Hash C1 mismatch on authentication final receive"
        ));
      }
    }
    if let Some(received_hash_c2) = &final_token.hash_c2 {
      if hash_c2 != *received_hash_c2 {
        return Err(create_security_error_and_log!(
          "Hash C2 mismatch on authentication final receive"
        ));
      }
    }

    // The DH keys in the final message must be the ones this handshake ran
    // on. A mismatch means someone altered the exchange in flight.
    if let Some(final_dh1) = &final_token.dh1 {
      if *final_dh1 != dh1_public {
        return Err(create_security_error_and_log!(
          "Diffie-Hellman parameter DH1 mismatch on authentication final receive"
        ));
      }
    }
    let dh2_public = dh2.public_key_bytes()?;
    if let Some(final_dh2) = &final_token.dh2 {
      if *final_dh2 != dh2_public {
        return Err(create_security_error_and_log!(
          "Diffie-Hellman parameter DH2 mismatch on authentication final receive"
        ));
      }
    }

    // Both challenges must match the ones from the reply.
    if challenge1.as_ref() != final_token.challenge1.as_ref() {
      return Err(create_security_error_and_log!(
        "process_handshake: Final token challenge1 mismatch"
      ));
    }
    if challenge2.as_ref() != final_token.challenge2.as_ref() {
      return Err(create_security_error_and_log!(
        "process_handshake: Final token challenge2 mismatch"
      ));
    }

    // Verify the final signature with the requester's certificate, which
    // was validated against the CA in the reply step.
    let remote_algorithm =
      CertificateAlgorithm::from_certificate_key(remote_id_certificate.key_algorithm())?;
    remote_id_certificate
      .verify_signed_data_with_algorithm(
        final_signature_image(
          hash_c1.as_ref(),
          challenge1.as_ref(),
          &dh1_public,
          challenge2.as_ref(),
          &dh2_public,
          hash_c2.as_ref(),
        ),
        &final_token.signature,
        remote_algorithm.verification_algorithm(),
      )
      .map_err(|e| {
        create_security_error_and_log!("Signature verification failed in process_handshake: {e}")
      })?;

    let shared_secret = dh2.compute_shared_secret(dh1_public)?;

    let remote_info = self.get_remote_participant_info_mutable(&remote_identity_handle)?;
    remote_info.handshake_state = BuiltinHandshakeState::CompletedWithFinalMessageReceived {
      challenge1,
      challenge2,
      shared_secret,
    };

    Ok((ValidationOutcome::Ok, None))
  }

  /// Available once the handshake has completed, in either terminal state.
  pub fn get_shared_secret(
    &self,
    remote_identity_handle: IdentityHandle,
  ) -> SecurityResult<SharedSecretHandle> {
    let remote_info = self.get_remote_participant_info(&remote_identity_handle)?;
    match &remote_info.handshake_state {
      BuiltinHandshakeState::CompletedWithFinalMessageSent {
        challenge1,
        challenge2,
        shared_secret,
      }
      | BuiltinHandshakeState::CompletedWithFinalMessageReceived {
        challenge1,
        challenge2,
        shared_secret,
      } => Ok(SharedSecretHandle {
        challenge1: challenge1.clone(),
        challenge2: challenge2.clone(),
        shared_secret: shared_secret.clone(),
      }),
      wrong_state => Err(create_security_error_and_log!(
        "get_shared_secret called in state {wrong_state:?}"
      )),
    }
  }

  /// The peer's identity certificate and permissions document, for access
  /// control after a completed handshake.
  pub fn get_authenticated_peer_credential_token(
    &self,
    handshake_handle: HandshakeHandle,
  ) -> SecurityResult<AuthenticatedPeerCredentialToken> {
    let identity_handle = self.handshake_handle_to_identity_handle(&handshake_handle)?;
    let remote_info = self.get_remote_participant_info(identity_handle)?;

    let id_cert = remote_info.identity_certificate.as_ref().ok_or_else(|| {
      security_error(
        "Remote's identity certificate missing. It should have been stored from handshake \
         messages",
      )
    })?;
    let permissions_doc = remote_info
      .signed_permissions_document
      .clone()
      .ok_or_else(|| {
        security_error(
          "Remote's permissions document missing. It should have been stored from handshake \
           messages",
        )
      })?;

    Ok(AuthenticatedPeerCredentialToken {
      c_id: Bytes::from(id_cert.to_pem()),
      c_perm: permissions_doc,
    })
  }

  /// Releases a handshake handle. Terminal results (certificates, shared
  /// secret) stay with the identity handle.
  pub fn return_handshake_handle(&mut self, handshake_handle: HandshakeHandle) -> SecurityResult<()> {
    self
      .handshake_to_identity_handle_map
      .remove(&handshake_handle)
      .map(|_| ())
      .ok_or_else(|| create_security_error_and_log!("Handshake handle unknown: {handshake_handle:?}"))
  }

  /// Failure cleanup: the handle dies with the failed handshake. The
  /// state rollback happens where the failure is detected.
  fn destroy_handshake(&mut self, handshake_handle: HandshakeHandle) {
    self.handshake_to_identity_handle_map.remove(&handshake_handle);
  }
}

fn config_error_to_security(what: &str, uri: &str, e: ConfigError) -> crate::security::SecurityError {
  match e {
    ConfigError::Parse(msg) => {
      create_security_error_and_log!("Failed to read the {what} from {uri}: {msg}")
    }
    other => create_security_error_and_log!("Failed to read the {what} from {uri}: {other:?}"),
  }
}

#[cfg(test)]
mod tests {
  use speedy::Endianness;

  use super::{super::tests::pl_cdr_pdata, *};
  use crate::{
    security::test_keys::{self, TestCa, TestIdentity},
    structure::guid::EntityId,
  };

  struct Participant {
    auth: AuthenticationBuiltin,
    local_handle: IdentityHandle,
    guid: GUID,
    pdata: Vec<u8>,
  }

  fn participant(ca: &TestCa, identity: &TestIdentity, candidate_prefix: [u8; 12]) -> Participant {
    let config = AuthenticationConfig {
      identity_ca: format!("data:,{}", ca.cert_pem),
      identity_certificate: format!("data:,{}", identity.cert_pem),
      identity_crl: None,
      private_key: format!("data:,{}", identity.key_pem),
      password: None,
      preferred_key_agreement: super::super::types::KeyAgreementPreference::Auto,
      transmit_algorithms_as_legacy: false,
    };
    let candidate = GUID::new(GuidPrefix::new(&candidate_prefix), EntityId::PARTICIPANT);
    let mut auth = AuthenticationBuiltin::new();
    let (outcome, local_handle, adjusted_guid) =
      auth.validate_local_identity(&config, candidate).unwrap();
    assert_eq!(outcome, ValidationOutcome::Ok);
    auth
      .set_permissions_credential(local_handle, Bytes::from_static(b"<permissions/>"))
      .unwrap();
    let pdata = pl_cdr_pdata(adjusted_guid, Endianness::BigEndian);
    Participant {
      auth,
      local_handle,
      guid: adjusted_guid,
      pdata,
    }
  }

  /// Runs discovery-time role assignment on both sides and returns
  /// (requester, replier) with each other's remote identity handles.
  fn assign_roles(
    mut a: Participant,
    mut b: Participant,
  ) -> (Participant, IdentityHandle, Participant, IdentityHandle) {
    let token_a = a.auth.get_identity_token(a.local_handle).unwrap();
    let token_b = b.auth.get_identity_token(b.local_handle).unwrap();

    let (oa, a_remote) = a
      .auth
      .validate_remote_identity(a.local_handle, &token_b, b.guid.prefix)
      .unwrap();
    let (ob, b_remote) = b
      .auth
      .validate_remote_identity(b.local_handle, &token_a, a.guid.prefix)
      .unwrap();

    if a.guid < b.guid {
      assert_eq!(oa, ValidationOutcome::PendingHandshakeRequest);
      assert_eq!(ob, ValidationOutcome::PendingHandshakeMessage);
      (a, a_remote, b, b_remote)
    } else {
      assert_eq!(ob, ValidationOutcome::PendingHandshakeRequest);
      assert_eq!(oa, ValidationOutcome::PendingHandshakeMessage);
      (b, b_remote, a, a_remote)
    }
  }

  fn run_handshake(
    requester: &mut Participant,
    requester_remote: IdentityHandle,
    replier: &mut Participant,
    replier_remote: IdentityHandle,
  ) -> (SharedSecretHandle, SharedSecretHandle) {
    // requester -> request
    let (outcome, req_hs_handle, request) = requester
      .auth
      .begin_handshake_request(
        requester.local_handle,
        requester_remote,
        requester.pdata.clone(),
      )
      .unwrap();
    assert_eq!(outcome, ValidationOutcome::PendingHandshakeMessage);
    assert_eq!(request.class_id(), HANDSHAKE_REQUEST_CLASS_ID);

    // replier -> reply
    let (outcome, rep_hs_handle, reply) = replier
      .auth
      .begin_handshake_reply(
        request,
        replier_remote,
        replier.local_handle,
        replier.pdata.clone(),
      )
      .unwrap();
    assert_eq!(outcome, ValidationOutcome::PendingHandshakeMessage);
    assert_eq!(reply.class_id(), HANDSHAKE_REPLY_CLASS_ID);

    // requester processes reply -> final message, terminal state
    let (outcome, final_message) = requester.auth.process_handshake(reply, req_hs_handle).unwrap();
    assert_eq!(outcome, ValidationOutcome::OkFinalMessage);
    let final_message = final_message.expect("expected a final message");
    assert_eq!(final_message.class_id(), HANDSHAKE_FINAL_CLASS_ID);

    // replier processes final -> terminal state, no further message
    let (outcome, nothing) = replier
      .auth
      .process_handshake(final_message, rep_hs_handle)
      .unwrap();
    assert_eq!(outcome, ValidationOutcome::Ok);
    assert!(nothing.is_none());

    let req_secret = requester.auth.get_shared_secret(requester_remote).unwrap();
    let rep_secret = replier.auth.get_shared_secret(replier_remote).unwrap();

    // peers' credentials are available on both sides now
    requester
      .auth
      .get_authenticated_peer_credential_token(req_hs_handle)
      .unwrap();
    replier
      .auth
      .get_authenticated_peer_credential_token(rep_hs_handle)
      .unwrap();

    (req_secret, rep_secret)
  }

  // The full three-step exchange with ECDSA identities: ECDH P-256 is
  // selected automatically, and both ends derive the same secret.
  #[test]
  fn handshake_succeeds_with_ecdh() {
    let ca = test_keys::test_ca();
    let alice = participant(&ca, &test_keys::test_identity(&ca, "Alice"), [1; 12]);
    let bob = participant(&ca, &test_keys::test_identity(&ca, "Bob"), [2; 12]);

    let (mut requester, req_remote, mut replier, rep_remote) = assign_roles(alice, bob);
    let (s1, s2) = run_handshake(&mut requester, req_remote, &mut replier, rep_remote);

    assert_eq!(s1.shared_secret, s2.shared_secret);
    assert_eq!(s1.challenge1, s2.challenge1);
    assert_eq!(s1.challenge2, s2.challenge2);
  }

  // With an RSA CA the AUTO preference selects classic DH 2048-256.
  #[test]
  fn handshake_succeeds_with_modp_dh() {
    let ca = test_keys::test_rsa_ca();
    let alice = participant(&ca, &test_keys::test_rsa_identity(&ca, "Alice"), [1; 12]);
    let bob = participant(&ca, &test_keys::test_rsa_identity(&ca, "Bob"), [2; 12]);

    let (mut requester, req_remote, mut replier, rep_remote) = assign_roles(alice, bob);
    let (s1, s2) = run_handshake(&mut requester, req_remote, &mut replier, rep_remote);
    assert_eq!(s1.shared_secret, s2.shared_secret);
  }

  // Tampering with dh1 in flight: the replier bases its handshake on the
  // altered key, so the requester's genuine final message no longer
  // matches and the replier rejects it. No secret is derived.
  #[test]
  fn tampered_dh1_fails_at_final_step() {
    let ca = test_keys::test_ca();
    let alice = participant(&ca, &test_keys::test_identity(&ca, "Alice"), [1; 12]);
    let bob = participant(&ca, &test_keys::test_identity(&ca, "Bob"), [2; 12]);
    let (mut requester, req_remote, mut replier, rep_remote) = assign_roles(alice, bob);

    let (_, req_hs_handle, request) = requester
      .auth
      .begin_handshake_request(
        requester.local_handle,
        req_remote,
        requester.pdata.clone(),
      )
      .unwrap();

    // flip one byte of dh1 on the wire
    let mut tampered = request;
    for bp in tampered.data_holder.binary_properties.iter_mut() {
      if bp.name == "dh1" {
        let mut bytes = bp.value.to_vec();
        bytes[10] ^= 0x01;
        bp.value = Bytes::from(bytes);
      }
    }

    let (_, rep_hs_handle, reply) = replier
      .auth
      .begin_handshake_reply(
        tampered,
        rep_remote,
        replier.local_handle,
        replier.pdata.clone(),
      )
      .unwrap();

    // requester still answers; its own dh1 never changed
    let (_, final_message) = requester.auth.process_handshake(reply, req_hs_handle).unwrap();

    // replier detects the mismatch and fails the handshake
    let result = replier
      .auth
      .process_handshake(final_message.unwrap(), rep_hs_handle);
    assert!(result.is_err());
    assert!(replier.auth.get_shared_secret(rep_remote).is_err());
    // the handle was destroyed with the failed handshake
    assert!(replier
      .auth
      .get_authenticated_peer_credential_token(rep_hs_handle)
      .is_err());
  }

  #[test]
  fn tampered_reply_signature_fails_at_requester() {
    let ca = test_keys::test_ca();
    let alice = participant(&ca, &test_keys::test_identity(&ca, "Alice"), [1; 12]);
    let bob = participant(&ca, &test_keys::test_identity(&ca, "Bob"), [2; 12]);
    let (mut requester, req_remote, mut replier, rep_remote) = assign_roles(alice, bob);

    let (_, req_hs_handle, request) = requester
      .auth
      .begin_handshake_request(
        requester.local_handle,
        req_remote,
        requester.pdata.clone(),
      )
      .unwrap();
    let (_, _rep_hs_handle, reply) = replier
      .auth
      .begin_handshake_reply(
        request,
        rep_remote,
        replier.local_handle,
        replier.pdata.clone(),
      )
      .unwrap();

    let mut tampered = reply;
    for bp in tampered.data_holder.binary_properties.iter_mut() {
      if bp.name == "signature" {
        let mut bytes = bp.value.to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        bp.value = Bytes::from(bytes);
      }
    }

    assert!(requester
      .auth
      .process_handshake(tampered, req_hs_handle)
      .is_err());
    assert!(requester.auth.get_shared_secret(req_remote).is_err());
  }

  // An identity from a different CA is rejected in the reply step.
  #[test]
  fn certificate_from_wrong_ca_is_rejected() {
    let ca = test_keys::test_ca();
    let rogue_ca = test_keys::test_ca();
    let alice = participant(&ca, &test_keys::test_identity(&ca, "Alice"), [1; 12]);
    let mallory = participant(
      &rogue_ca,
      &test_keys::test_identity(&rogue_ca, "Mallory"),
      [2; 12],
    );
    let (mut requester, req_remote, mut replier, rep_remote) = assign_roles(alice, mallory);

    let (_, _hs, request) = requester
      .auth
      .begin_handshake_request(
        requester.local_handle,
        req_remote,
        requester.pdata.clone(),
      )
      .unwrap();
    let result = replier.auth.begin_handshake_reply(
      request,
      rep_remote,
      replier.local_handle,
      replier.pdata.clone(),
    );
    assert!(result.is_err());
  }

  // A revoked identity fails local validation against a configured CRL.
  #[test]
  fn revoked_identity_fails_local_validation() {
    let ca = test_keys::test_ca();
    let identity = test_keys::test_identity(&ca, "Revoked");
    let cert = Certificate::from_pem(&identity.cert_pem).unwrap();
    let crl_pem = test_keys::test_crl(&ca, &[&cert]);

    let config = AuthenticationConfig {
      identity_ca: format!("data:,{}", ca.cert_pem),
      identity_certificate: format!("data:,{}", identity.cert_pem),
      identity_crl: Some(format!("data:,{crl_pem}")),
      private_key: format!("data:,{}", identity.key_pem),
      password: None,
      preferred_key_agreement: super::super::types::KeyAgreementPreference::Auto,
      transmit_algorithms_as_legacy: false,
    };
    let mut auth = AuthenticationBuiltin::new();
    let candidate = GUID::new(GuidPrefix::new(&[3; 12]), EntityId::PARTICIPANT);
    assert!(auth.validate_local_identity(&config, candidate).is_err());
  }

  #[test]
  fn unsupported_uri_scheme_is_reported_as_such() {
    let ca = test_keys::test_ca();
    let identity = test_keys::test_identity(&ca, "UriTest");
    let config = AuthenticationConfig {
      identity_ca: "https://example.com/ca.pem".to_string(),
      identity_certificate: format!("data:,{}", identity.cert_pem),
      identity_crl: None,
      private_key: format!("data:,{}", identity.key_pem),
      password: None,
      preferred_key_agreement: super::super::types::KeyAgreementPreference::Auto,
      transmit_algorithms_as_legacy: false,
    };
    let mut auth = AuthenticationBuiltin::new();
    let candidate = GUID::new(GuidPrefix::new(&[3; 12]), EntityId::PARTICIPANT);
    let err = auth
      .validate_local_identity(&config, candidate)
      .unwrap_err();
    assert!(err.msg.contains("Unsupported URI format"), "got: {}", err.msg);
  }

  // A participant's own identity handle resolves to a self-shared secret.
  #[test]
  fn self_identity_has_a_shared_secret() {
    let ca = test_keys::test_ca();
    let p = participant(&ca, &test_keys::test_identity(&ca, "Selfish"), [4; 12]);
    p.auth.get_shared_secret(p.local_handle).unwrap();
  }
}
