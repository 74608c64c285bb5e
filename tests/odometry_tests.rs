use rovercore::rover::{advance_pose, heading_delta, wrap_angle};
use rovercore::*;
use std::f32::consts::{FRAC_PI_2, PI};

#[test]
fn test_equal_deltas_drive_straight() {
    let (pose, velocity) = advance_pose(Pose2D::default(), 5.0, 5.0, 10.0, 0.5);

    assert_eq!(pose.angle, 0.0);
    assert!((pose.x - 5.0).abs() < 1e-5);
    assert!(pose.y.abs() < 1e-6);
    assert!(velocity.angular.abs() < 1e-6);
    assert!((velocity.x - 10.0).abs() < 1e-4);
}

#[test]
fn test_unequal_deltas_turn_exactly() {
    assert_eq!(heading_delta(4.0, 6.0, 10.0), 0.2);

    let (pose, velocity) = advance_pose(Pose2D::default(), 4.0, 6.0, 10.0, 0.5);
    assert_eq!(pose.angle, 0.2);
    assert!((velocity.angular - 0.4).abs() < 1e-6);
    // Mean distance 5 along the mid heading 0.1
    assert!((pose.x - 5.0 * 0.1f32.cos()).abs() < 1e-5);
    assert!((pose.y - 5.0 * 0.1f32.sin()).abs() < 1e-5);
}

#[test]
fn test_heading_stays_wrapped() {
    let start = Pose2D::new(0.0, 0.0, PI - 0.05);
    let (pose, _) = advance_pose(start, 0.0, 1.0, 10.0, 0.1);
    assert!(pose.angle > -PI && pose.angle <= PI);
    assert!((pose.angle - (-PI + 0.05)).abs() < 1e-4);
}

#[test]
fn test_pure_rotation_keeps_position() {
    let (pose, velocity) = advance_pose(Pose2D::default(), -1.0, 1.0, 2.0, 1.0);
    assert_eq!(pose.x, 0.0);
    assert_eq!(pose.y, 0.0);
    assert_eq!(pose.angle, 1.0);
    assert_eq!(velocity.angular, 1.0);
}

#[test]
fn test_quarter_circle_arc() {
    // Integrate a quarter turn of radius 1 in small steps
    let wheelbase = 0.5;
    let radius = 1.0;
    let steps = 200;
    let arc = FRAC_PI_2 / steps as f32;
    let left = (radius - wheelbase / 2.0) * arc;
    let right = (radius + wheelbase / 2.0) * arc;

    let mut pose = Pose2D::default();
    for _ in 0..steps {
        pose = advance_pose(pose, left, right, wheelbase, 0.01).0;
    }
    assert!((pose.x - 1.0).abs() < 1e-3);
    assert!((pose.y - 1.0).abs() < 1e-3);
    assert!((pose.angle - FRAC_PI_2).abs() < 1e-4);
}

#[test]
fn test_wrap_angle_is_half_open() {
    assert_eq!(wrap_angle(-PI), PI);
    assert_eq!(wrap_angle(0.0), 0.0);
    assert!((wrap_angle(2.0 * PI + 0.5) - 0.5).abs() < 1e-5);
}

#[test]
fn test_simulated_straight_drive_matches_plant() {
    let mut sim = Simulation::new(SimConfig::default());
    sim.submit(RoverCommand::Tank(TankCommand::power(true, 200, true, 200)))
        .unwrap();
    sim.run_for(2000);

    let pose = sim.agent().rover().pose();
    let travelled = sim.left_plant().position();
    assert!(travelled > 0.5);
    assert!((pose.x - travelled).abs() < 0.05);
    assert!(pose.y.abs() < 1e-4);
    assert!(pose.angle.abs() < 1e-6);
}

#[test]
fn test_reset_pose_command_rezeroes() {
    let mut sim = Simulation::new(SimConfig::default());
    sim.submit(RoverCommand::Tank(TankCommand::power(true, 200, false, 200)))
        .unwrap();
    sim.run_for(500);
    assert!(sim.agent().rover().pose().angle.abs() > 0.1);

    sim.submit(RoverCommand::Halt).unwrap();
    sim.submit(RoverCommand::ResetPose).unwrap();
    sim.step();
    assert_eq!(sim.agent().rover().pose(), Pose2D::default());
}

#[test]
fn test_still_rover_keeps_reporting_pose() {
    let mut sim = Simulation::new(SimConfig::default());
    sim.run_for(1000);
    let reports = sim.agent().recorder().count(MessageKind::RoverPose);
    // Initial zeroing plus a heartbeat every still_report_ms
    let period = SimConfig::default().rover.still_report_ms;
    assert!(reports >= 1000 / period);
}
